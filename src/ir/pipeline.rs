//! Pipeline descriptions.
//!
//! The target describes each opcode with a [`Pipeline`]: how many issue slots it takes, which
//! functional units it occupies in each cycle after issue, and its latencies. The target as a
//! whole is described by [`PipelineInfo`].

use crate::bitset::ScalarBitSet;
use crate::buffer::CodeOffset;
use bitflags::bitflags;
use smallvec::SmallVec;

/// A set of functional units, one bit per unit.
pub type ResourceMask = ScalarBitSet<u32>;

/// Build a resource mask from unit numbers.
pub fn resource_mask(units: &[u8]) -> ResourceMask {
    let mut mask = ResourceMask::new();
    for &u in units {
        mask.insert(u);
    }
    mask
}

/// Do two resource masks share a unit?
pub fn resources_overlap(a: ResourceMask, b: ResourceMask) -> bool {
    b.iter().any(|unit| a.contains(unit))
}

/// Union of two resource masks.
pub fn resources_union(a: ResourceMask, b: ResourceMask) -> ResourceMask {
    let mut m = a;
    for unit in b.iter() {
        m.insert(unit);
    }
    m
}

bitflags! {
    /// Instructions that must not sit directly next to each other.
    ///
    /// An instruction with `BEFORE` must not directly follow an instruction with `AFTER`.
    /// A nop is inserted between them when needed.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct AvoidAdjacent: u8 {
        /// Do not place this instruction right after an `AFTER` instruction.
        const BEFORE = 1 << 0;
        /// Do not place a `BEFORE` instruction right after this one.
        const AFTER = 1 << 1;
    }
}

/// Pipeline behavior of one opcode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pipeline {
    /// Number of issue slots the instruction takes in its bundle.
    pub instruction_count: u32,

    /// Functional units used, one mask per cycle starting with the issue cycle.
    pub resources: SmallVec<[ResourceMask; 4]>,

    /// Cycles until the result is available to a consumer.
    pub fixed_latency: u32,

    /// Per-operand latency overrides, indexed by input position.
    pub operand_latencies: SmallVec<[u32; 4]>,

    /// The instruction may encode to zero bytes.
    pub may_have_no_code: bool,

    /// The instruction is followed by a branch delay slot.
    pub has_branch_delay: bool,

    /// The instruction occupies a bundle of its own.
    pub has_multiple_bundles: bool,

    /// Adjacency restrictions.
    pub avoid: AvoidAdjacent,
}

impl Pipeline {
    /// A single-slot instruction with the given latency and no resources.
    pub fn new(fixed_latency: u32) -> Self {
        Self {
            instruction_count: 1,
            resources: SmallVec::new(),
            fixed_latency,
            operand_latencies: SmallVec::new(),
            may_have_no_code: false,
            has_branch_delay: false,
            has_multiple_bundles: false,
            avoid: AvoidAdjacent::empty(),
        }
    }

    /// A description for instructions that never produce code, like block markers.
    pub fn empty() -> Self {
        Self {
            instruction_count: 0,
            may_have_no_code: true,
            ..Self::new(0)
        }
    }

    /// Set the units used per cycle; `stages[0]` is the issue cycle.
    pub fn with_resources(mut self, stages: &[&[u8]]) -> Self {
        self.resources = stages.iter().map(|s| resource_mask(s)).collect();
        self
    }

    /// Mark the instruction as having a branch delay slot.
    pub fn with_branch_delay(mut self) -> Self {
        self.has_branch_delay = true;
        self
    }

    /// Mark the instruction as needing a bundle to itself.
    pub fn with_multiple_bundles(mut self) -> Self {
        self.has_multiple_bundles = true;
        self
    }

    /// Set the adjacency restrictions.
    pub fn with_avoid(mut self, avoid: AvoidAdjacent) -> Self {
        self.avoid = avoid;
        self
    }

    /// Override the latency of individual operands.
    pub fn with_operand_latencies(mut self, latencies: &[u32]) -> Self {
        self.operand_latencies = latencies.iter().copied().collect();
        self
    }

    /// Cycles between issuing `def` and issuing this instruction, which reads the result of
    /// `def` as operand `operand`.
    pub fn operand_latency(&self, operand: usize, def: &Pipeline) -> u32 {
        self.operand_latencies
            .get(operand)
            .copied()
            .unwrap_or(def.fixed_latency)
    }

    /// Resources used in the issue cycle.
    pub fn issue_resources(&self) -> ResourceMask {
        self.resources
            .first()
            .copied()
            .unwrap_or_else(ResourceMask::new)
    }
}

/// Pipeline properties of a whole target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineInfo {
    /// Maximum number of issue slots in one bundle.
    pub max_instrs_per_cycle: u32,

    /// Branches on this target have a delay slot.
    pub branch_has_delay_slot: bool,

    /// Size of every instruction on fixed-width targets.
    pub instr_unit_size: Option<CodeOffset>,

    /// Bundles are explicit in the encoding and must be flushed at boundaries.
    pub requires_bundling: bool,
}

impl PipelineInfo {
    /// A single-issue target with variable width instructions.
    pub fn scalar() -> Self {
        Self {
            max_instrs_per_cycle: 1,
            branch_has_delay_slot: false,
            instr_unit_size: None,
            requires_bundling: false,
        }
    }
}
