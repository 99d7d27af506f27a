//! Safepoint and scope descriptions.
//!
//! The emitter streams debug information into a [`DebugInfoSink`] as code is emitted. For
//! every safepoint it reports the oop map and one [`ScopeDescription`] per inlining level,
//! outermost first, bracketed by [`DebugInfoSink::add_safepoint`] and
//! [`DebugInfoSink::end_safepoint`].
//!
//! Sinks that also want the scope of ordinary instructions say so through
//! [`DebugInfoSink::recording_non_safepoints`]. Those descriptions are produced lazily by the
//! [`NonSafepointEmitter`], which merges runs of instructions with the same call chain into a
//! single record at the end of the run.

use crate::buffer::CodeOffset;
use crate::ir::{
    Function, InstFlags, MethodRef, MonitorInput, OopMap, OptoReg, RegAssignment, ScopeInput,
    ScopeRef,
};

/// What a value in a location holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum LocationKind {
    /// An untyped value that fits one slot.
    Normal,
    /// A reference the garbage collector must update.
    Oop,
    /// A value spanning two slots.
    Wide,
}

/// Where a value lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum Location {
    /// A machine register.
    Register(OptoReg),
    /// A stack slot, by byte offset from the stack pointer.
    Stack(i32),
}

/// The value of a local, expression stack entry or monitor owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub enum ScopeValue {
    /// A value held in a location.
    Location {
        /// The register or stack slot.
        location: Location,
        /// What the location holds.
        kind: LocationKind,
    },
    /// A constant.
    ConstantInt(i64),
    /// A dead value.
    Illegal,
}

/// A locked monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct MonitorValue {
    /// The locked object.
    pub owner: ScopeValue,
    /// The stack slot holding the lock record.
    pub basic_lock: Location,
    /// The lock was removed by the optimizer.
    pub eliminated: bool,
}

/// One inlining level of the debug state at a code offset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct ScopeDescription {
    /// The method of this level.
    pub method: Option<MethodRef>,
    /// Bytecode index within `method`.
    pub bci: i32,
    /// The bytecode at `bci` is re-executed when deoptimizing.
    pub reexecute: bool,
    /// The safepoint is a method handle invoke.
    pub method_handle_invoke: bool,
    /// The safepoint is a call returning a reference.
    pub return_oop: bool,
    /// Local variables.
    pub locals: Vec<ScopeValue>,
    /// Expression stack.
    pub expressions: Vec<ScopeValue>,
    /// Locked monitors.
    pub monitors: Vec<MonitorValue>,
}

/// Receiver of the debug information of emitted code.
pub trait DebugInfoSink {
    /// Start the record of the safepoint at `pc_offset`.
    fn add_safepoint(&mut self, pc_offset: CodeOffset, oop_map: &OopMap);

    /// Add one scope to the current record. Scopes come outermost first.
    fn describe_scope(&mut self, pc_offset: CodeOffset, scope: ScopeDescription);

    /// Close the safepoint record.
    fn end_safepoint(&mut self, pc_offset: CodeOffset);

    /// Does the sink want scopes for instructions that are not safepoints?
    fn recording_non_safepoints(&self) -> bool {
        false
    }

    /// Start the record of a non-safepoint at `pc_offset`.
    fn add_non_safepoint(&mut self, pc_offset: CodeOffset) {
        let _ = pc_offset;
    }

    /// Close the non-safepoint record.
    fn end_non_safepoint(&mut self, pc_offset: CodeOffset) {
        let _ = pc_offset;
    }

    /// Offset of the last record, if any.
    fn last_pc_offset(&self) -> Option<CodeOffset>;
}

/// A debug information record.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct PcDesc {
    /// Code offset described.
    pub pc_offset: CodeOffset,
    /// Live references, for safepoints.
    pub oop_map: Option<OopMap>,
    /// Scopes, outermost first.
    pub scopes: Vec<ScopeDescription>,
}

/// A sink keeping every record in memory.
#[derive(Clone, Debug, Default)]
pub struct DebugInfoRecorder {
    record_non_safepoints: bool,
    pcs: Vec<PcDesc>,
    open: Option<PcDesc>,
}

impl DebugInfoRecorder {
    /// A recorder for safepoints only.
    pub fn new() -> Self {
        Self::default()
    }

    /// A recorder that also keeps non-safepoint records.
    pub fn with_non_safepoints() -> Self {
        Self {
            record_non_safepoints: true,
            ..Self::default()
        }
    }

    /// The closed records, in emission order.
    pub fn pcs(&self) -> &[PcDesc] {
        &self.pcs
    }

    /// The safepoint records.
    pub fn safepoints(&self) -> impl Iterator<Item = &PcDesc> + '_ {
        self.pcs.iter().filter(|pc| pc.oop_map.is_some())
    }

    /// The record at `pc_offset`.
    pub fn find(&self, pc_offset: CodeOffset) -> Option<&PcDesc> {
        self.pcs.iter().find(|pc| pc.pc_offset == pc_offset)
    }

    fn close(&mut self, pc_offset: CodeOffset) {
        if let Some(pc) = self.open.take() {
            debug_assert_eq!(pc.pc_offset, pc_offset);
            self.pcs.push(pc);
        }
    }
}

impl DebugInfoSink for DebugInfoRecorder {
    fn add_safepoint(&mut self, pc_offset: CodeOffset, oop_map: &OopMap) {
        debug_assert!(self.open.is_none());
        self.open = Some(PcDesc {
            pc_offset,
            oop_map: Some(oop_map.clone()),
            scopes: Vec::new(),
        });
    }

    fn describe_scope(&mut self, pc_offset: CodeOffset, scope: ScopeDescription) {
        if let Some(pc) = self.open.as_mut() {
            debug_assert_eq!(pc.pc_offset, pc_offset);
            pc.scopes.push(scope);
        }
    }

    fn end_safepoint(&mut self, pc_offset: CodeOffset) {
        self.close(pc_offset);
    }

    fn recording_non_safepoints(&self) -> bool {
        self.record_non_safepoints
    }

    fn add_non_safepoint(&mut self, pc_offset: CodeOffset) {
        debug_assert!(self.open.is_none());
        self.open = Some(PcDesc {
            pc_offset,
            oop_map: None,
            scopes: Vec::new(),
        });
    }

    fn end_non_safepoint(&mut self, pc_offset: CodeOffset) {
        self.close(pc_offset);
    }

    fn last_pc_offset(&self) -> Option<CodeOffset> {
        self.pcs.last().map(|pc| pc.pc_offset)
    }
}

fn location(regs: &RegAssignment, reg: OptoReg) -> Location {
    if regs.is_reg(reg) {
        Location::Register(reg)
    } else {
        Location::Stack(regs.reg2offset(reg))
    }
}

fn scope_value(func: &Function, regs: &RegAssignment, input: &ScopeInput) -> ScopeValue {
    match *input {
        ScopeInput::Top => ScopeValue::Illegal,
        ScopeInput::Int(v) => ScopeValue::ConstantInt(v),
        ScopeInput::Value(inst) => {
            let assigned = regs.get(inst);
            let Some(first) = assigned.first.expand() else {
                return ScopeValue::Illegal;
            };
            let kind = if func.insts[inst].flags.contains(InstFlags::OOP) {
                LocationKind::Oop
            } else if assigned.second.is_some() {
                LocationKind::Wide
            } else {
                LocationKind::Normal
            };
            ScopeValue::Location {
                location: location(regs, first),
                kind,
            }
        }
    }
}

fn monitor_value(func: &Function, regs: &RegAssignment, m: &MonitorInput) -> MonitorValue {
    let owner = match scope_value(func, regs, &m.object) {
        ScopeValue::Location { location, .. } => ScopeValue::Location {
            location,
            kind: LocationKind::Oop,
        },
        other => other,
    };
    MonitorValue {
        owner,
        basic_lock: Location::Stack(regs.reg2offset(m.box_slot)),
        eliminated: m.eliminated,
    }
}

/// Flags of the safepoint being described.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SafepointInfo {
    pub method_handle_invoke: bool,
    pub return_oop: bool,
}

/// Report the scopes of `scope` and its callers, outermost first.
///
/// Levels without a method only report their monitors.
pub(crate) fn describe_scopes(
    func: &Function,
    regs: &RegAssignment,
    scope: ScopeRef,
    pc_offset: CodeOffset,
    info: SafepointInfo,
    sink: &mut dyn DebugInfoSink,
) {
    let max_depth = func.scope_depth(scope);
    for depth in 1..=max_depth {
        let s = func.scope_at_depth(scope, depth);
        let data = &func.scopes[s];
        debug_assert!(!data.reexecute || depth == max_depth);
        let mut desc = ScopeDescription {
            method: data.method.or(func.method),
            bci: data.bci,
            reexecute: data.reexecute,
            method_handle_invoke: info.method_handle_invoke,
            return_oop: info.return_oop,
            ..ScopeDescription::default()
        };
        if data.method.is_some() {
            desc.locals = data
                .locals
                .iter()
                .map(|l| scope_value(func, regs, l))
                .collect();
            desc.expressions = data
                .stack
                .iter()
                .map(|e| scope_value(func, regs, e))
                .collect();
        }
        desc.monitors = data
            .monitors
            .iter()
            .map(|m| monitor_value(func, regs, m))
            .collect();
        sink.describe_scope(pc_offset, desc);
    }
}

/// Lazily records the scope of instructions between safepoints.
///
/// A record for a run of instructions sharing one call chain is emitted at the end offset of
/// the last instruction of the run.
#[derive(Debug, Default)]
pub struct NonSafepointEmitter {
    pending: Option<(ScopeRef, CodeOffset)>,
}

impl NonSafepointEmitter {
    /// A new emitter with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Note an instruction with `scope` ending at `pc_offset`.
    pub fn observe_instruction(
        &mut self,
        func: &Function,
        scope: Option<ScopeRef>,
        pc_offset: CodeOffset,
        sink: &mut dyn DebugInfoSink,
    ) {
        if !sink.recording_non_safepoints() {
            return;
        }
        let Some(scope) = scope else { return };
        match self.pending {
            Some((p, _)) if func.same_calls_as(p, scope) => {
                self.pending = Some((p, pc_offset));
            }
            _ => {
                if let Some((_, offset)) = self.pending {
                    if offset < pc_offset {
                        self.emit(func, sink);
                    }
                }
                self.pending = None;
                if sink.last_pc_offset().is_none_or(|last| pc_offset > last) {
                    self.pending = Some((scope, pc_offset));
                }
            }
        }
    }

    /// Note a safepoint at `pc_offset`. A pending record with another call chain is flushed.
    pub fn observe_safepoint(
        &mut self,
        func: &Function,
        scope: Option<ScopeRef>,
        pc_offset: CodeOffset,
        sink: &mut dyn DebugInfoSink,
    ) {
        if let Some((p, offset)) = self.pending {
            let same = scope.is_some_and(|s| func.same_calls_as(p, s));
            if !same && offset < pc_offset {
                self.emit(func, sink);
            }
        }
        self.pending = None;
    }

    /// Flush the pending record.
    pub fn flush_at_end(&mut self, func: &Function, sink: &mut dyn DebugInfoSink) {
        if self.pending.is_some() {
            self.emit(func, sink);
        }
        self.pending = None;
    }

    fn emit(&mut self, func: &Function, sink: &mut dyn DebugInfoSink) {
        let Some((scope, pc_offset)) = self.pending.take() else {
            return;
        };
        debug_assert!(sink.recording_non_safepoints());
        trace!("non-safepoint {scope} at {pc_offset:#x}");
        sink.add_non_safepoint(pc_offset);
        let max_depth = func.scope_depth(scope);
        for depth in 1..=max_depth {
            let data = &func.scopes[func.scope_at_depth(scope, depth)];
            sink.describe_scope(
                pc_offset,
                ScopeDescription {
                    method: data.method,
                    bci: data.bci,
                    reexecute: data.reexecute,
                    ..ScopeDescription::default()
                },
            );
        }
        sink.end_non_safepoint(pc_offset);
    }
}
