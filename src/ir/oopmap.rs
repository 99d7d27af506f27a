use crate::bitset::CompoundBitSet;
use crate::entity::EntityRef;
use crate::ir::OptoReg;
use smallvec::SmallVec;

/// Oop maps record which registers and stack slots hold live GC references at a safepoint.
///
/// The map is indexed by allocator register number, so machine registers and stack slots
/// share one numbering (see [`RegAssignment`](super::RegAssignment)). Derived pointers, which
/// point into the middle of an object, are recorded together with the base register the
/// collector must update them from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Deserialize, serde_derive::Serialize)
)]
pub struct OopMap {
    oops: CompoundBitSet,
    derived: SmallVec<[(OptoReg, OptoReg); 2]>,
}

impl OopMap {
    /// An empty oop map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an oop map from the registers holding references.
    pub fn from_regs(regs: &[OptoReg]) -> Self {
        let mut map = Self::new();
        for &r in regs {
            map.set_oop(r);
        }
        map
    }

    /// Record that `reg` holds a reference.
    pub fn set_oop(&mut self, reg: OptoReg) {
        self.oops.insert(reg.index());
    }

    /// Record that `derived` points into the object referenced by `base`.
    pub fn set_derived(&mut self, derived: OptoReg, base: OptoReg) {
        self.derived.push((derived, base));
    }

    /// Does `reg` hold a reference?
    pub fn is_oop(&self, reg: OptoReg) -> bool {
        self.oops.contains(reg.index())
    }

    /// Registers holding references, lowest first.
    pub fn oops(&self) -> impl Iterator<Item = OptoReg> + '_ {
        self.oops.iter().map(OptoReg::new)
    }

    /// `(derived, base)` pairs.
    pub fn derived(&self) -> &[(OptoReg, OptoReg)] {
        &self.derived
    }

    /// Does the map record nothing at all?
    pub fn is_empty(&self) -> bool {
        self.oops.is_empty() && self.derived.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oop_maps() {
        assert!(OopMap::new().is_empty());

        let set = [5, 7, 24, 31].map(OptoReg::new);
        let mut map = OopMap::from_regs(&set);
        assert!(map.is_oop(OptoReg::new(5)));
        assert!(map.is_oop(OptoReg::new(31)));
        assert!(!map.is_oop(OptoReg::new(1)));
        assert_eq!(map.oops().collect::<Vec<_>>(), set);

        map.set_derived(OptoReg::new(40), OptoReg::new(5));
        assert_eq!(map.derived(), &[(OptoReg::new(40), OptoReg::new(5))]);
        assert!(!map.is_empty());
    }
}
