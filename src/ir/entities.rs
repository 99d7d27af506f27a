//! Entity references used by the output pipeline.
//!
//! Instructions, blocks and the other objects of a function live in tables inside
//! [`Function`](super::Function). They refer to each other with these small index types rather
//! than with Rust references, which keeps the graph compact and the borrow checker out of the
//! way while passes rewrite block order in place.

use crate::entity::entity_impl;
use core::fmt;
#[cfg(feature = "enable-serde")]
use serde_derive::{Deserialize, Serialize};

/// An opaque reference to an instruction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// An opaque reference to a basic block.
///
/// Blocks are numbered in emission order: `block0` is emitted first.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Block(u32);
entity_impl!(Block, "block");

/// A reference to one level of an interpreter scope chain.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct ScopeRef(u32);
entity_impl!(ScopeRef, "scope");

/// A reference to an entry of the function's constant table.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Constant(u32);
entity_impl!(Constant, "const");

/// An opaque handle to a source method, as known by the debug information recorder.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct MethodRef(u32);
entity_impl!(MethodRef, "method");

/// A register or stack slot number assigned by the register allocator.
///
/// Numbers below [`RegAssignment::first_stack_slot`](super::RegAssignment::first_stack_slot)
/// are machine registers. The rest are stack slots.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct OptoReg(u32);
entity_impl!(OptoReg, "r");

/// A target instruction opcode.
///
/// The numbering belongs to the target; the output pipeline only compares opcodes and hands
/// them back to the [`TargetIsa`](crate::isa::TargetIsa).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Opcode(pub u16);

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
