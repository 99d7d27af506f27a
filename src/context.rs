//! Output context and main entry point.
//!
//! A [`Context`] turns register-allocated functions into machine code, one call to
//! [`Context::compile`] per function. It keeps the output settings and remembers the first
//! failure: once a compile has failed, the context refuses to do more work and keeps returning
//! that failure.

use crate::buffer::{CodeBuffer, CodeOffset, FinalizedCodeBuffer, SectionSizes};
use crate::code_cache::CodeCache;
use crate::debuginfo::DebugInfoSink;
use crate::emit::{ConstantLayout, EmitStats, Emitter, HandlerOffsets, loop_first_inst_sizes};
use crate::ir::{Block, Function, RegAssignment};
use crate::isa::TargetIsa;
use crate::result::{ErrorKind, OutputError, OutputResult};
use crate::sched::{Schedule, ScheduleStats, schedule_function};
use crate::settings::Flags;
use crate::shorten::Layout;
use crate::tables::{ExceptionHandlerTable, ImplicitNullCheckTable};
use crate::timing::{self, PassTimes};
use log::debug;

/// Counters describing one compile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutputStats {
    /// Size of the instruction section as estimated before emission.
    pub estimated_size: CodeOffset,
    /// Size of the instruction section as emitted.
    pub code_size: CodeOffset,
    /// Sweeps taken by branch shortening.
    pub shortening_sweeps: u32,
    /// Branches emitted.
    pub branches: u32,
    /// Branches shortened during emission.
    pub late_shortened: u32,
    /// Nops inserted.
    pub nops: u32,
    /// Bytes of inserted nops.
    pub nop_bytes: CodeOffset,
    /// Instructions emitted.
    pub instructions: u32,
    /// Issue bundles formed by the scheduler.
    pub bundles: u32,
    /// Instructions placed by the scheduler.
    pub scheduled: u32,
    /// Branches with a delay slot.
    pub delay_branches: u32,
    /// Delay slots filled with a useful instruction.
    pub delay_slots_filled: u32,
    /// Pinch points used by the anti-dependence builder.
    pub pinch_points: u32,
    /// Time spent in each pass.
    pub times: PassTimes,
}

impl OutputStats {
    fn new(
        layout: &Layout,
        sched: &ScheduleStats,
        emit: &EmitStats,
        code_size: CodeOffset,
    ) -> Self {
        Self {
            estimated_size: layout.code_size(),
            code_size,
            shortening_sweeps: layout.sweeps(),
            branches: emit.branches,
            late_shortened: emit.late_shortened,
            nops: emit.nops,
            nop_bytes: emit.nop_bytes,
            instructions: emit.instructions,
            bundles: sched.bundles,
            scheduled: sched.instructions,
            delay_branches: sched.branches,
            delay_slots_filled: sched.delay_slots_filled,
            pinch_points: sched.pinch_points,
            times: PassTimes::default(),
        }
    }

    /// Average number of instructions per issue bundle, or 0 if nothing was scheduled.
    pub fn instructions_per_bundle(&self) -> f64 {
        if self.bundles == 0 {
            0.0
        } else {
            f64::from(self.scheduled) / f64::from(self.bundles)
        }
    }
}

/// The machine code of one function and its side tables.
#[derive(Debug)]
pub struct CompiledCode {
    /// The constant, instruction and stub sections.
    pub buffer: FinalizedCodeBuffer,
    /// Final block offsets.
    pub layout: Layout,
    /// Exception handlers per call site.
    pub exception_table: ExceptionHandlerTable,
    /// Implicit null checks and trap-based checks.
    pub null_check_table: ImplicitNullCheckTable,
    /// Handler stub offsets within the stub section.
    pub handlers: HandlerOffsets,
    /// Size of the first block.
    pub first_block_size: CodeOffset,
    /// Counters.
    pub stats: OutputStats,
}

impl CompiledCode {
    /// Offset of `block` in the instruction section.
    pub fn block_offset(&self, block: Block) -> CodeOffset {
        self.layout.block_start(block)
    }

    /// Size of the instruction section.
    pub fn code_size(&self) -> CodeOffset {
        self.layout.code_size()
    }
}

/// Persistent state for emitting functions.
pub struct Context {
    flags: Flags,
    failure: Option<OutputError>,
    compilable: bool,
}

impl Context {
    /// A context using `flags`.
    pub fn new(flags: Flags) -> Self {
        Self {
            flags,
            failure: None,
            compilable: true,
        }
    }

    /// The output settings.
    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// The first failure recorded, if any.
    pub fn failure(&self) -> Option<&OutputError> {
        self.failure.as_ref()
    }

    /// Can the functions handed to this context still be compiled at this tier?
    pub fn is_compilable(&self) -> bool {
        self.compilable
    }

    /// Record a failure. Only the first one is kept.
    pub fn record_failure(&mut self, err: OutputError) {
        if err.kind() == ErrorKind::Permanent {
            self.compilable = false;
        }
        if self.failure.is_none() {
            debug!("output failed: {err}");
            self.failure = Some(err);
        }
    }

    /// Emit `func` for `isa`.
    ///
    /// Branch shortening and scheduling update `func` in place: branch opcodes and the order
    /// of instructions in each block change. Safepoint descriptions go to `sink` as code is
    /// emitted.
    pub fn compile<I: TargetIsa>(
        &mut self,
        func: &mut Function,
        isa: &I,
        regs: &RegAssignment,
        cache: &dyn CodeCache,
        sink: &mut dyn DebugInfoSink,
    ) -> OutputResult<CompiledCode> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let before = timing::current();
        match self.run(func, isa, regs, cache, sink) {
            Ok(mut code) => {
                code.stats.times = timing::current().since(&before);
                debug!(
                    "output took {:?}, {:?} of it emitting",
                    code.stats.times.total(timing::Pass::output),
                    code.stats.times.total(timing::Pass::emit)
                );
                Ok(code)
            }
            Err(err) => {
                self.record_failure(err.clone());
                Err(err)
            }
        }
    }

    fn run<I: TargetIsa>(
        &self,
        func: &mut Function,
        isa: &I,
        regs: &RegAssignment,
        cache: &dyn CodeCache,
        sink: &mut dyn DebugInfoSink,
    ) -> OutputResult<CompiledCode> {
        let _tt = timing::output();
        debug!(
            "output for {} on {}: {} blocks, {} instructions",
            func.method.map_or_else(|| "stub".to_string(), |m| m.to_string()),
            isa.name(),
            func.num_blocks(),
            func.insts.len()
        );

        let constants = ConstantLayout::compute(func);

        let layout = Layout::estimate(func, isa, regs)?.shorten(func, isa, regs);
        layout.verify_short_branches(isa)?;
        layout.apply_branch_forms(func);

        let request = self.buffer_request(func, isa, &constants, &layout);
        let granted = {
            let _tt = timing::reserve_buffer();
            cache.reserve(request).ok_or(OutputError::CodeCacheFull)?
        };
        trace!("requested {request:?}, granted {granted:?}");
        let buf = CodeBuffer::new(granted);

        let schedule = if self.flags.opt_scheduling() && func.method.is_some() {
            schedule_function(func, isa, regs, &self.flags)?
        } else {
            Schedule::default()
        };

        let first_inst_sizes = loop_first_inst_sizes(func, isa, regs, &self.flags);
        let emission = Emitter::new(
            isa,
            regs,
            &self.flags,
            &layout,
            &constants,
            &schedule.bundles,
            &first_inst_sizes,
        )
        .emit(func, buf, sink)?;

        let stats = OutputStats::new(
            &layout,
            &schedule.stats,
            &emission.stats,
            emission.layout.code_size(),
        );
        debug!(
            "{} bytes of code ({} estimated), {} nops, {:.2} instructions per bundle",
            stats.code_size,
            stats.estimated_size,
            stats.nops,
            stats.instructions_per_bundle()
        );

        Ok(CompiledCode {
            buffer: emission.buffer,
            layout: emission.layout,
            exception_table: emission.exception_table,
            null_check_table: emission.null_check_table,
            handlers: emission.handlers,
            first_block_size: emission.first_block_size,
            stats,
        })
    }

    /// Buffer capacities needed to emit `func` with `layout`.
    fn buffer_request<I: TargetIsa>(
        &self,
        func: &Function,
        isa: &I,
        constants: &ConstantLayout,
        layout: &Layout,
    ) -> SectionSizes {
        let stub_margin = self.flags.max_stub_size();
        let mut stubs = layout.stub_size() + stub_margin;
        if func.method.is_some() {
            stubs += isa.exception_handler_size() + stub_margin;
            stubs += isa.deopt_handler_size() + stub_margin;
            if func.has_method_handle_invokes() {
                stubs += isa.deopt_handler_size() + stub_margin;
            }
        }
        SectionSizes {
            consts: constants.size() as usize,
            insts: (layout.code_size() + self.flags.max_inst_size()) as usize,
            stubs: stubs as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_cache::{CodeCacheBudget, SectionLimits, UnlimitedCodeCache};
    use crate::debuginfo::DebugInfoRecorder;
    use crate::entity::EntityRef;
    use crate::ir::{
        CallData, FunctionBuilder, InstFlags, InstKind, MethodRef, OopMap, SafePointData,
        ScopeData,
    };
    use crate::isa::toy::{self, ToyIsa, gpr, opcodes::*};
    use crate::settings::{self, Configurable};

    fn no_scheduling() -> Flags {
        let mut b = settings::builder();
        b.set("opt_scheduling", "false").unwrap();
        Flags::new(b)
    }

    fn compile(
        ctx: &mut Context,
        fb: FunctionBuilder,
        isa: &ToyIsa,
    ) -> (Function, OutputResult<CompiledCode>, DebugInfoRecorder) {
        let (mut func, regs) = fb.finish();
        let mut sink = DebugInfoRecorder::new();
        let res = ctx.compile(&mut func, isa, &regs, &UnlimitedCodeCache, &mut sink);
        (func, res, sink)
    }

    /// A conditional branch over `loads` 3-byte loads and one filler nop.
    fn forward_branch(method: Option<MethodRef>, loads: usize) -> FunctionBuilder {
        let mut fb = toy::builder(method);
        let b0 = fb.block();
        let b1 = fb.block();
        let b2 = fb.block();
        let c = fb.ins(b0, CMP, &[], Some(toy::flags()));
        fb.ins_kind(b0, JCC, InstKind::Branch { conditional: true }, &[c], None);
        fb.succs(b0, &[b2, b1]);
        for _ in 0..loads {
            fb.ins(b1, LOAD, &[], Some(gpr(1)));
        }
        fb.ins_kind(b1, NOP, InstKind::Nop, &[], None);
        fb.succs(b1, &[b2]);
        fb.ins_kind(b2, RET, InstKind::Return, &[], None);
        fb
    }

    #[test]
    fn register_reuse_survives_scheduling() {
        let _ = env_logger::try_init();
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(Some(MethodRef::new(0)));
        let b = fb.block();
        let x = fb.ins(b, LOAD, &[], Some(gpr(1)));
        let sx = fb.ins(b, STORE, &[x], None);
        let y = fb.ins(b, LOAD, &[], Some(gpr(1)));
        let sy = fb.ins(b, STORE, &[y], None);
        fb.ins_kind(b, RET, InstKind::Return, &[], None);

        let mut ctx = Context::new(Flags::default());
        let (func, res, _) = compile(&mut ctx, fb, &isa);
        let code = res.unwrap();
        let pos = |i| func.blocks[b].insts.iter().position(|&j| j == i).unwrap();
        assert!(pos(sx) < pos(y));
        assert!(pos(y) < pos(sy));
        assert_eq!(code.code_size(), 3 * 4 + 1);
        assert_eq!(code.stats.scheduled, 5);
        assert!(code.stats.bundles > 0);
    }

    #[test]
    fn forward_branch_is_short_and_sized_exactly() {
        let _ = env_logger::try_init();
        let isa = ToyIsa::cisc();
        let mut ctx = Context::new(Flags::default());
        let (func, res, _) = compile(&mut ctx, forward_branch(None, 13), &isa);
        let code = res.unwrap();

        let b0 = Block::new(0);
        let jcc = func.blocks[b0].insts[1];
        assert_eq!(func.insts[jcc].opcode, JCC_SHORT);
        assert_eq!(code.layout.block_starts(), &[0, 5, 45, 46]);
        assert_eq!(code.stats.estimated_size, code.stats.code_size);
        assert_eq!(code.code_size(), 46);
        assert_eq!(code.first_block_size, 5);
        assert_eq!(code.buffer.insts().len(), 46);
        assert_eq!(code.buffer.insts()[3..5], [0x70, 40]);
        assert_eq!(code.stats.nops, 0);
        assert_eq!(code.handlers, HandlerOffsets::default());
    }

    #[test]
    fn safepoint_after_call_gets_one_nop() {
        let _ = env_logger::try_init();
        let isa = ToyIsa::cisc();
        let method = MethodRef::new(0);
        let mut fb = toy::builder(Some(method));
        let b = fb.block();
        let scope = fb.func_mut().add_scope(ScopeData::new(Some(method), 3));
        let call = CallData {
            safepoint: SafePointData {
                scope: scope.into(),
                oop_map: OopMap::from_regs(&[gpr(3)]),
            },
            ..CallData::default()
        };
        fb.ins_kind(b, CALL, InstKind::Call(Box::new(call)), &[], None);
        fb.ins_kind(b, POLL, InstKind::SafePoint(Box::default()), &[], None);
        fb.ins_kind(b, RET, InstKind::Return, &[], None);

        let mut ctx = Context::new(no_scheduling());
        let (_, res, sink) = compile(&mut ctx, fb, &isa);
        let code = res.unwrap();

        assert_eq!(code.stats.nops, 1);
        assert_eq!(code.buffer.insts()[5], 0x90);
        assert_eq!(code.code_size(), 5 + 1 + 3 + 1);
        let pcs: Vec<_> = sink.safepoints().map(|pc| pc.pc_offset).collect();
        assert_eq!(pcs, [5, 6]);
        let at_call = sink.find(5).unwrap();
        assert_eq!(at_call.scopes.len(), 1);
        assert_eq!(at_call.scopes[0].bci, 3);
        assert!(at_call.oop_map.as_ref().unwrap().is_oop(gpr(3)));
        // The poll has no scope: root map only.
        assert!(sink.find(6).unwrap().scopes.is_empty());

        // The call stub comes first in the stub section, then the handlers.
        assert_eq!(code.handlers.exception, Some(8));
        assert_eq!(code.handlers.deopt, Some(13));
        assert_eq!(code.handlers.deopt_mh, None);
    }

    #[test]
    fn small_buffer_fails() {
        let isa = ToyIsa::cisc();
        let (mut func, regs) = forward_branch(None, 13).finish();
        let mut ctx = Context::new(Flags::default());
        let limits = SectionLimits(SectionSizes {
            consts: 64,
            insts: 20,
            stubs: 256,
        });
        let mut sink = DebugInfoRecorder::new();
        let res = ctx.compile(&mut func, &isa, &regs, &limits, &mut sink);
        assert_eq!(res.unwrap_err(), OutputError::CodeCacheFull);
        assert_eq!(ctx.failure(), Some(&OutputError::CodeCacheFull));
        assert!(ctx.is_compilable());

        // The failure sticks, even with room to spare.
        let res = ctx.compile(&mut func, &isa, &regs, &UnlimitedCodeCache, &mut sink);
        assert_eq!(res.unwrap_err(), OutputError::CodeCacheFull);
    }

    #[test]
    fn refused_reservation_fails() {
        let isa = ToyIsa::cisc();
        let (mut func, regs) = forward_branch(None, 13).finish();
        let mut ctx = Context::new(Flags::default());
        let budget = CodeCacheBudget::new(100);
        let res = ctx.compile(&mut func, &isa, &regs, &budget, &mut DebugInfoRecorder::new());
        assert_eq!(res.unwrap_err(), OutputError::CodeCacheFull);
        assert_eq!(budget.available(), 100);
    }

    #[test]
    fn permanent_failure_marks_not_compilable() {
        let mut ctx = Context::new(Flags::default());
        let block = Block::new(2);
        ctx.record_failure(OutputError::TooManyPinchPoints { block });
        ctx.record_failure(OutputError::CodeCacheFull);
        assert!(!ctx.is_compilable());
        assert_eq!(
            ctx.failure(),
            Some(&OutputError::TooManyPinchPoints { block })
        );

        let isa = ToyIsa::cisc();
        let (_, res, _) = compile(&mut ctx, forward_branch(None, 1), &isa);
        assert_eq!(res.unwrap_err(), OutputError::TooManyPinchPoints { block });
    }

    #[test]
    fn exception_handlers_of_calls() {
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(Some(MethodRef::new(0)));
        let b0 = fb.block();
        let b1 = fb.block();
        let b2 = fb.block();
        let b3 = fb.block();
        fb.ins_kind(b0, CALL, InstKind::Call(Box::default()), &[], None);
        let handlers = [None, Some(7), Some(7), Some(9)].into_iter().collect();
        fb.ins_kind(b0, CATCH, InstKind::Catch(handlers), &[], None);
        fb.succs(b0, &[b1, b2, b2, b3]);
        fb.ins_kind(b1, RET, InstKind::Return, &[], None);
        fb.ins_kind(b2, RET, InstKind::Return, &[], None);
        fb.ins_kind(b3, RET, InstKind::Return, &[], None);

        let mut ctx = Context::new(no_scheduling());
        let (_, res, _) = compile(&mut ctx, fb, &isa);
        let code = res.unwrap();

        assert_eq!(code.layout.block_starts(), &[0, 5, 6, 7, 8]);
        let table = &code.exception_table;
        assert_eq!(table.callsites(), &[5]);
        assert_eq!(table.lookup(5, 7), Some(6));
        assert_eq!(table.lookup(5, 9), Some(7));
        assert_eq!(table.subtable(5).unwrap().count(), 2);
    }

    #[test]
    fn null_and_trap_checks() {
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b0 = fb.block();
        let b1 = fb.block();
        let b2 = fb.block();
        let b3 = fb.block();
        let x = fb.ins(b0, LOAD, &[], Some(gpr(1)));
        fb.ins_kind(b0, NULL_CHECK, InstKind::NullCheck { memory: x }, &[x], None);
        fb.succs(b0, &[b3, b1]);
        fb.ins(b1, MOV, &[], Some(gpr(2)));
        let trap = fb.ins(b1, LOAD, &[], Some(gpr(3)));
        fb.flags(trap, InstFlags::TRAP_CHECK);
        fb.succs(b1, &[b3, b2]);
        fb.ins_kind(b2, RET, InstKind::Return, &[], None);
        fb.ins_kind(b3, RET, InstKind::Return, &[], None);

        let mut ctx = Context::new(Flags::default());
        let (_, res, _) = compile(&mut ctx, fb, &isa);
        let code = res.unwrap();

        assert_eq!(code.layout.block_starts(), &[0, 3, 8, 9, 10]);
        let checks: Vec<_> = code.null_check_table.iter().collect();
        assert_eq!(checks, [(0, 9), (5, 9)]);
    }

    #[test]
    fn loop_headers_are_aligned() {
        let isa = ToyIsa::cisc();

        // 8 bytes of padding are always applied.
        let mut fb = toy::builder(None);
        let b0 = fb.block();
        let b1 = fb.block();
        for _ in 0..4 {
            fb.ins(b0, MOV, &[], Some(gpr(0)));
        }
        fb.align(b1, 16);
        fb.ins_kind(b1, RET, InstKind::Return, &[], None);
        let mut ctx = Context::new(Flags::default());
        let (_, res, _) = compile(&mut ctx, fb, &isa);
        let code = res.unwrap();
        assert_eq!(code.block_offset(b1), 16);
        assert_eq!(code.stats.nops, 8);

        // 14 bytes are too many when the loop body fits in the rest of the window anyway.
        let mut fb = toy::builder(None);
        let b0 = fb.block();
        let b1 = fb.block();
        fb.ins(b0, MOV, &[], Some(gpr(0)));
        fb.align(b1, 16);
        fb.ins_kind(b1, RET, InstKind::Return, &[], None);
        let mut ctx = Context::new(Flags::default());
        let (_, res, _) = compile(&mut ctx, fb, &isa);
        let code = res.unwrap();
        assert_eq!(code.block_offset(b1), 2);
        assert_eq!(code.stats.nops, 0);
    }

    #[test]
    fn constants_reach_the_encoder() {
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b = fb.block();
        fb.func_mut().add_constant(&[0xaa; 3], 1);
        let c = fb.func_mut().add_constant(&1.5f64.to_bits().to_le_bytes(), 8);
        let load = fb.ins(b, LOAD_CONST, &[], Some(gpr(4)));
        fb.func_mut().insts[load].constant = c.into();
        fb.ins_kind(b, RET, InstKind::Return, &[], None);

        let mut ctx = Context::new(Flags::default());
        let (_, res, _) = compile(&mut ctx, fb, &isa);
        let code = res.unwrap();
        assert_eq!(code.buffer.consts().len(), 16);
        assert_eq!(code.buffer.consts()[8..], 1.5f64.to_bits().to_le_bytes());
        assert_eq!(code.buffer.insts()[2..6], 8u32.to_le_bytes());
    }

    #[test]
    fn passes_are_timed() {
        use crate::timing::Pass;
        use std::time::Duration;

        let isa = ToyIsa::cisc();
        let _ = crate::take_current();
        let mut ctx = Context::new(Flags::default());
        let (_, res, _) = compile(&mut ctx, forward_branch(Some(MethodRef::new(1)), 2), &isa);
        let first = res.unwrap().stats.times;
        assert!(first.total(Pass::output) > Duration::ZERO);
        assert!(first.total(Pass::output) >= first.total(Pass::emit));
        assert!(first.iter().any(|(pass, _)| pass == Pass::schedule));
        assert!(first.to_string().contains("Code emission"));

        // Each compile reports its own share; the thread keeps the sum.
        let mut ctx = Context::new(no_scheduling());
        let (_, res, _) = compile(&mut ctx, forward_branch(Some(MethodRef::new(2)), 2), &isa);
        let second = res.unwrap().stats.times;
        assert_eq!(second.total(Pass::schedule), Duration::ZERO);
        assert!(second.total(Pass::output) > Duration::ZERO);

        let mut sum = first;
        sum.add(&second);
        assert_eq!(crate::take_current(), sum);
    }
}
