//! Interpreter scopes attached to safepoints and other instructions.
//!
//! A scope describes where the interpreter would be if execution were transferred back to it at
//! a given instruction: which method, which bytecode index, and where the locals, expression
//! stack entries and locked monitors of that frame live. Inlined code has a chain of scopes,
//! linked through `caller`, with the outermost method at the end of the chain.

use crate::entity::packed_option::PackedOption;
use crate::ir::{Inst, MethodRef, OptoReg, ScopeRef};

/// The value of one interpreter slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeInput {
    /// The value computed by an instruction; its location comes from the register assignment.
    Value(Inst),
    /// An integer constant.
    Int(i64),
    /// A slot without a live value.
    Top,
}

/// A monitor held by an interpreter frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorInput {
    /// The locked object.
    pub object: ScopeInput,
    /// Stack slot holding the lock record.
    pub box_slot: OptoReg,
    /// The lock was removed by the optimizer and must be re-acquired on deoptimization.
    pub eliminated: bool,
}

/// One level of a scope chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeData {
    /// The calling scope, for inlined code.
    pub caller: PackedOption<ScopeRef>,
    /// The method this scope belongs to. `None` for synthetic code without a method, which
    /// still reports its monitors.
    pub method: Option<MethodRef>,
    /// Bytecode index.
    pub bci: i32,
    /// The bytecode at `bci` must be executed again after deoptimization.
    pub reexecute: bool,
    /// Local variables.
    pub locals: Vec<ScopeInput>,
    /// Expression stack entries.
    pub stack: Vec<ScopeInput>,
    /// Locked monitors, outermost first.
    pub monitors: Vec<MonitorInput>,
}

impl ScopeData {
    /// A scope at `bci` of `method` with no slots.
    pub fn new(method: Option<MethodRef>, bci: i32) -> Self {
        Self {
            caller: None.into(),
            method,
            bci,
            reexecute: false,
            locals: Vec::new(),
            stack: Vec::new(),
            monitors: Vec::new(),
        }
    }

    /// Set the caller of this scope.
    pub fn with_caller(mut self, caller: ScopeRef) -> Self {
        self.caller = caller.into();
        self
    }
}
