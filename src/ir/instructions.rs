//! Instruction data.
//!
//! Every instruction carries a target [`Opcode`] and an [`InstKind`] telling the output
//! pipeline what role it plays: calls, safepoints, branches and the other kinds get special
//! treatment during shortening, scheduling and emission. The bytes themselves are produced by
//! the target from the opcode and the assigned registers.

use crate::entity::packed_option::PackedOption;
use crate::ir::{Constant, Inst, OopMap, Opcode, RegMask, ScopeRef};
use bitflags::bitflags;
use smallvec::SmallVec;

bitflags! {
    /// Properties of an instruction that matter to the output pipeline.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct InstFlags: u8 {
        /// The instruction must stay at the head of its block and is never scheduled.
        const PINNED = 1 << 0;
        /// The instruction is a compare feeding a conditional branch.
        const COMPARE = 1 << 1;
        /// The result points into the middle of an object.
        const DERIVED_PTR = 1 << 2;
        /// The result is a reference the garbage collector must know about.
        const OOP = 1 << 3;
        /// The instruction traps on a null operand and is recorded as an implicit check.
        const TRAP_CHECK = 1 << 4;
    }
}

/// Debug state recorded at a safepoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SafePointData {
    /// Innermost interpreter scope, if any.
    pub scope: PackedOption<ScopeRef>,
    /// Live references.
    pub oop_map: OopMap,
}

/// A call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallData {
    /// Calls to leaf routines never stop for the garbage collector and have no debug state.
    pub leaf: bool,
    /// The call goes through a method handle and may need the special deopt handler.
    pub method_handle_invoke: bool,
    /// The callee returns a reference.
    pub returns_oop: bool,
    /// Debug state at the return address.
    pub safepoint: SafePointData,
}

/// The role of an instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstKind {
    /// An ordinary instruction.
    Plain,
    /// A no-op.
    Nop,
    /// A call.
    Call(Box<CallData>),
    /// A safepoint poll.
    SafePoint(Box<SafePointData>),
    /// A branch to successor #0 of its block.
    Branch {
        /// The branch falls through to successor #1 when not taken.
        conditional: bool,
    },
    /// An implicit null check on the memory access `memory`.
    ///
    /// If `memory` faults, control transfers to the block's successor #0.
    NullCheck {
        /// The memory access that may fault.
        memory: Inst,
    },
    /// Exception dispatch after the preceding call.
    ///
    /// `handlers[i]` is the handler bytecode index for block successor `i`, or `None` for the
    /// fall-through successor.
    Catch(SmallVec<[Option<i32>; 4]>),
    /// A return.
    Return,
    /// A trap that never continues.
    Halt,
}

/// An instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstData {
    /// Target opcode. Branch shortening may switch it to the short form.
    pub opcode: Opcode,
    /// Role of the instruction.
    pub kind: InstKind,
    /// Value operands.
    pub inputs: SmallVec<[Inst; 4]>,
    /// Ordering-only operands: they must be scheduled before this instruction.
    pub prec: SmallVec<[Inst; 2]>,
    /// Registers clobbered as a side effect, like the caller-saved set of a call.
    pub kills: Option<Box<RegMask>>,
    /// Miscellaneous properties.
    pub flags: InstFlags,
    /// Interpreter scope for non-safepoint debug information.
    pub scope: PackedOption<ScopeRef>,
    /// Constant table entry read by the instruction.
    pub constant: PackedOption<Constant>,
}

impl InstData {
    /// A plain instruction with the given operands.
    pub fn new(opcode: Opcode, kind: InstKind, inputs: &[Inst]) -> Self {
        Self {
            opcode,
            kind,
            inputs: inputs.iter().copied().collect(),
            prec: SmallVec::new(),
            kills: None,
            flags: InstFlags::empty(),
            scope: None.into(),
            constant: None.into(),
        }
    }

    /// Is this a call, leaf or not?
    pub fn is_call(&self) -> bool {
        matches!(self.kind, InstKind::Call(_))
    }

    /// Is this a call that records a safepoint?
    pub fn is_non_leaf_call(&self) -> bool {
        matches!(&self.kind, InstKind::Call(c) if !c.leaf)
    }

    /// Is this a point where the garbage collector may stop the thread?
    pub fn is_safepoint(&self) -> bool {
        match &self.kind {
            InstKind::SafePoint(_) => true,
            InstKind::Call(c) => !c.leaf,
            _ => false,
        }
    }

    /// The debug state of a safepoint.
    pub fn safepoint_data(&self) -> Option<&SafePointData> {
        match &self.kind {
            InstKind::SafePoint(sp) => Some(sp),
            InstKind::Call(c) if !c.leaf => Some(&c.safepoint),
            _ => None,
        }
    }

    /// Is this a branch?
    pub fn is_branch(&self) -> bool {
        matches!(self.kind, InstKind::Branch { .. })
    }

    /// Is this a conditional branch?
    pub fn is_conditional_branch(&self) -> bool {
        matches!(self.kind, InstKind::Branch { conditional: true })
    }

    /// Does the instruction end its block?
    pub fn is_block_end(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Branch { .. } | InstKind::Return | InstKind::Halt | InstKind::Catch(_)
        )
    }

    /// Registers clobbered as a side effect.
    pub fn kill_mask(&self) -> Option<&RegMask> {
        self.kills.as_deref()
    }
}
