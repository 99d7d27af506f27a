//! Issue bundles and the resource window used to fill them.

use crate::ir::pipeline::{resources_overlap, resources_union};
use crate::ir::{Pipeline, ResourceMask};
use smallvec::SmallVec;

/// Bundling record of one scheduled instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bundle {
    /// The instruction is the first of its issue bundle.
    pub starts_bundle: bool,
    /// The instruction is a branch whose delay slot holds another instruction.
    pub use_delay: bool,
    /// The instruction was moved into the delay slot of the following branch.
    pub used_in_delay: bool,
    /// Number of issue slots used by the bundle, on the bundle's first instruction.
    pub instr_count: u32,
    /// Units used by the bundle in its issue cycle, on the bundle's first instruction.
    pub resources_used: ResourceMask,
}

impl Default for Bundle {
    fn default() -> Self {
        Self {
            starts_bundle: false,
            use_delay: false,
            used_in_delay: false,
            instr_count: 0,
            resources_used: ResourceMask::new(),
        }
    }
}

/// Units reserved in the current cycle and the cycles after it.
///
/// Slot 0 is the cycle being filled. Stepping moves the window forward and forgets the cycles
/// left behind.
#[derive(Clone, Debug, Default)]
pub struct BundleUse {
    cycles: SmallVec<[ResourceMask; 8]>,
}

impl BundleUse {
    /// An empty window.
    pub fn new() -> Self {
        Self::default()
    }

    fn at(&self, cycle: usize) -> ResourceMask {
        self.cycles
            .get(cycle)
            .copied()
            .unwrap_or_else(ResourceMask::new)
    }

    /// Smallest delay of at least `delay` cycles at which `pipeline` can issue without
    /// conflicting with the reserved units.
    pub fn full_latency(&self, delay: u32, pipeline: &Pipeline) -> u32 {
        let mut d = delay as usize;
        while pipeline
            .resources
            .iter()
            .enumerate()
            .any(|(k, &mask)| resources_overlap(self.at(d + k), mask))
        {
            d += 1;
        }
        d as u32
    }

    /// Reserve the units of `pipeline`, issued in the current cycle.
    pub fn add_usage(&mut self, pipeline: &Pipeline) {
        for (k, &mask) in pipeline.resources.iter().enumerate() {
            if self.cycles.len() <= k {
                self.cycles.resize(k + 1, ResourceMask::new());
            }
            self.cycles[k] = resources_union(self.cycles[k], mask);
        }
    }

    /// Units reserved in the current cycle.
    pub fn resources_used(&self) -> ResourceMask {
        self.at(0)
    }

    /// Move the window `cycles` cycles forward.
    pub fn step(&mut self, cycles: u32) {
        let n = (cycles as usize).min(self.cycles.len());
        self.cycles.drain(..n);
    }

    /// Forget every reservation.
    pub fn reset(&mut self) {
        self.cycles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_delay_issue() {
        let alu = Pipeline::new(1).with_resources(&[&[0]]);
        let mul = Pipeline::new(3).with_resources(&[&[0], &[0]]);
        let mem = Pipeline::new(3).with_resources(&[&[2]]);

        let mut window = BundleUse::new();
        assert_eq!(window.full_latency(0, &mul), 0);
        window.add_usage(&mul);
        assert_eq!(window.full_latency(0, &mem), 0);
        assert_eq!(window.full_latency(0, &alu), 2);
        assert_eq!(window.full_latency(3, &alu), 3);
        assert!(window.resources_used().contains(0));

        window.step(1);
        assert_eq!(window.full_latency(0, &alu), 1);
        window.step(1);
        assert_eq!(window.full_latency(0, &alu), 0);

        window.add_usage(&alu);
        window.reset();
        assert_eq!(window.full_latency(0, &alu), 0);
    }

    #[test]
    fn default_bundle_is_clear() {
        let b = Bundle::default();
        assert!(!b.starts_bundle && !b.use_delay && !b.used_in_delay);
        assert_eq!(b.resources_used.len(), 0);
    }
}
