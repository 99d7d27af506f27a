//! Register assignment, as handed over by the register allocator.

use crate::bitset::CompoundBitSet;
use crate::entity::packed_option::PackedOption;
use crate::entity::{EntityRef, SecondaryMap};
use crate::ir::{Inst, OptoReg};
use core::fmt;

/// A set of registers.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegMask {
    bits: CompoundBitSet,
}

impl RegMask {
    /// An empty mask.
    pub fn new() -> Self {
        Self::default()
    }

    /// A mask holding exactly `regs`.
    pub fn from_regs(regs: &[OptoReg]) -> Self {
        let mut mask = Self::new();
        for &r in regs {
            mask.insert(r);
        }
        mask
    }

    /// Add `reg`. Returns whether it was newly added.
    pub fn insert(&mut self, reg: OptoReg) -> bool {
        self.bits.insert(reg.index())
    }

    /// Does the mask contain `reg`?
    pub fn contains(&self, reg: OptoReg) -> bool {
        self.bits.contains(reg.index())
    }

    /// Is the mask empty?
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// The registers of the mask, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = OptoReg> + '_ {
        self.bits.iter().map(OptoReg::new)
    }
}

impl fmt::Debug for RegMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// The locations of one instruction's result.
///
/// Two-word values occupy a pair of registers; single-word values have no `second`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegPair {
    /// First (low) half.
    pub first: PackedOption<OptoReg>,
    /// Second (high) half, for two-word values.
    pub second: PackedOption<OptoReg>,
}

impl RegPair {
    /// A single register result.
    pub fn single(reg: OptoReg) -> Self {
        Self {
            first: reg.into(),
            second: None.into(),
        }
    }

    /// A two-register result.
    pub fn pair(first: OptoReg, second: OptoReg) -> Self {
        Self {
            first: first.into(),
            second: second.into(),
        }
    }

    /// Both halves, without repeating a register.
    pub fn regs(self) -> impl Iterator<Item = OptoReg> {
        let first = self.first.expand();
        let second = self.second.expand().filter(|&s| Some(s) != first);
        first.into_iter().chain(second)
    }
}

/// Result locations of every instruction of a function.
#[derive(Clone, Debug)]
pub struct RegAssignment {
    locations: SecondaryMap<Inst, RegPair>,
    first_stack_slot: u32,
    slot_size: u32,
}

impl RegAssignment {
    /// An assignment for a target with `num_regs` machine registers and stack slots of
    /// `slot_size` bytes.
    pub fn new(num_regs: u32, slot_size: u32) -> Self {
        Self {
            locations: SecondaryMap::new(),
            first_stack_slot: num_regs,
            slot_size,
        }
    }

    /// Record the location of `inst`'s result.
    pub fn assign(&mut self, inst: Inst, pair: RegPair) {
        self.locations[inst] = pair;
    }

    /// The full location of `inst`'s result.
    pub fn get(&self, inst: Inst) -> RegPair {
        self.locations[inst]
    }

    /// First half of `inst`'s result location.
    pub fn first(&self, inst: Inst) -> Option<OptoReg> {
        self.locations[inst].first.expand()
    }

    /// Second half of `inst`'s result location.
    pub fn second(&self, inst: Inst) -> Option<OptoReg> {
        self.locations[inst].second.expand()
    }

    /// Number of the first stack slot; every lower number is a machine register.
    pub fn first_stack_slot(&self) -> u32 {
        self.first_stack_slot
    }

    /// Is `reg` a machine register rather than a stack slot?
    pub fn is_reg(&self, reg: OptoReg) -> bool {
        reg.index() < self.first_stack_slot as usize
    }

    /// The stack slot with index `slot`.
    pub fn stack_slot(&self, slot: u32) -> OptoReg {
        OptoReg::new((self.first_stack_slot + slot) as usize)
    }

    /// Byte offset of a stack slot from the stack pointer.
    pub fn reg2offset(&self, reg: OptoReg) -> i32 {
        debug_assert!(!self.is_reg(reg), "{reg} is not a stack slot");
        let slot = reg.index() as i64 - i64::from(self.first_stack_slot);
        (slot * i64::from(self.slot_size)) as i32
    }
}
