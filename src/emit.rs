//! Final code emission.
//!
//! The [`Emitter`] walks the blocks in layout order and encodes every instruction into a
//! [`CodeBuffer`]. On the way it inserts the padding the target needs, tries one last time to
//! shorten branches whose distance is now known, streams safepoint descriptions into the
//! debug information sink, and collects the offsets needed for the exception and implicit
//! null check tables. The result is an [`Emission`]: the finalized buffer, the final layout and
//! the side tables.
//!
//! The layout handed to the emitter must come from [`Layout::shorten`]. Its block sizes are an
//! upper bound on the emitted sizes, so every short branch chosen before emission still
//! reaches its target. A block that grows anyway is reported as
//! [`OutputError::BlockSizeIncreased`].

use crate::buffer::{CodeBuffer, CodeOffset, FinalizedCodeBuffer, MachLabel, Section};
use crate::debuginfo::{self, DebugInfoSink, NonSafepointEmitter, SafepointInfo};
use crate::entity::{EntityRef, SecondaryMap};
use crate::ir::{
    AvoidAdjacent, Block, Constant, Function, Inst, InstFlags, InstKind, RegAssignment,
};
use crate::isa::{EmitInfo, TargetIsa};
use crate::result::{OutputError, OutputResult};
use crate::sched::Bundle;
use crate::settings::Flags;
use crate::shorten::{BranchSite, Layout};
use crate::tables::{ExceptionHandlerTable, HandlerEntry, ImplicitNullCheckTable};
use crate::timing;
use log::debug;
use smallvec::SmallVec;

/// Offsets of the constant table entries within the constant section.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConstantLayout {
    offsets: SecondaryMap<Constant, CodeOffset>,
    size: CodeOffset,
}

impl ConstantLayout {
    /// Lay out the constants of `func`, each at its required alignment.
    pub fn compute(func: &Function) -> Self {
        let _tt = timing::constants();
        let mut layout = Self::default();
        let mut offset: CodeOffset = 0;
        for (constant, data) in func.constants.iter() {
            let align = data.align.max(1);
            debug_assert!(align.is_power_of_two());
            offset = (offset + align - 1) & !(align - 1);
            layout.offsets[constant] = offset;
            offset += data.bytes.len() as CodeOffset;
        }
        layout.size = offset;
        layout
    }

    /// Offset of `constant` from the start of the constant section.
    pub fn offset(&self, constant: Constant) -> CodeOffset {
        self.offsets[constant]
    }

    /// Size of the constant section.
    pub fn size(&self) -> CodeOffset {
        self.size
    }

    /// Write the constants into `section`.
    pub fn emit_into(&self, func: &Function, section: &mut Section) {
        for (constant, data) in func.constants.iter() {
            section.align_to(data.align.max(1));
            debug_assert!(section.overflowed() || section.cur_offset() == self.offsets[constant]);
            section.put_data(&data.bytes);
        }
    }
}

/// Size of the first instructions of every loop header.
///
/// Loop padding larger than `max_loop_pad` is only worth it if the first
/// `loop_instrs_to_align` instructions of the loop would otherwise straddle a fetch window of
/// `loop_alignment` bytes. Instructions are counted across the blocks that fall through from
/// the header, up to the next aligned block or the back branch. Blocks that are not loop
/// headers get `CodeOffset::MAX`, which never skips padding.
pub fn loop_first_inst_sizes<I: TargetIsa>(
    func: &Function,
    isa: &I,
    regs: &RegAssignment,
    flags: &Flags,
) -> SecondaryMap<Block, CodeOffset> {
    let mut sizes = SecondaryMap::with_default(CodeOffset::MAX);
    let window = flags.loop_alignment();
    if flags.max_loop_pad() >= window.saturating_sub(1) {
        return sizes;
    }

    let unit = isa.addr_unit();
    let nblocks = func.num_blocks();
    let mut i = 1;
    while i < nblocks {
        let head = Block::new(i);
        if func.blocks[head].alignment > unit {
            let mut sum = 0;
            let mut remaining = first_inst_size(
                func,
                isa,
                regs,
                head,
                &mut sum,
                flags.loop_instrs_to_align(),
                window,
            );
            let mut nb = head;
            while remaining > 0 && i + 1 < nblocks {
                let next = Block::new(i + 1);
                if func.blocks[next].alignment > unit || func.has_successor(nb, head) {
                    break;
                }
                i += 1;
                nb = next;
                remaining = first_inst_size(func, isa, regs, nb, &mut sum, remaining, window);
            }
            trace!("{head}: first instructions take {sum} bytes");
            sizes[head] = sum;
        }
        i += 1;
    }
    sizes
}

/// Add up to `count` non-empty instructions of `block` to `sum` while they fit in `window`.
///
/// Returns the number of instructions still to count, or 0 once the window is full.
fn first_inst_size<I: TargetIsa>(
    func: &Function,
    isa: &I,
    regs: &RegAssignment,
    block: Block,
    sum: &mut CodeOffset,
    mut count: u32,
    window: CodeOffset,
) -> u32 {
    for &inst in &func.blocks[block].insts {
        if count == 0 {
            break;
        }
        let size = isa.inst_size(func, inst, func.insts[inst].opcode, regs);
        if size > 0 {
            count -= 1;
            if *sum + size <= window {
                *sum += size;
            } else {
                return 0;
            }
        }
    }
    count
}

/// Padding before a block with `align` starting at `offset`.
fn loop_padding(
    align: CodeOffset,
    unit: CodeOffset,
    offset: CodeOffset,
    max_loop_pad: CodeOffset,
    first_inst_size: CodeOffset,
) -> CodeOffset {
    let max_pad = align.max(unit) - unit;
    if max_pad == 0 {
        return 0;
    }
    let misalign = offset & max_pad;
    if misalign == 0 {
        return 0;
    }
    let pad = (align - misalign) & max_pad;
    if pad > max_loop_pad && first_inst_size <= pad {
        0
    } else {
        pad
    }
}

/// Offsets of the handler stubs in the stub section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandlerOffsets {
    /// The exception handler.
    pub exception: Option<CodeOffset>,
    /// The deoptimization handler.
    pub deopt: Option<CodeOffset>,
    /// The deoptimization handler for method handle invokes.
    pub deopt_mh: Option<CodeOffset>,
}

/// Counters collected during emission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmitStats {
    /// Instructions encoded, delay slot instructions included.
    pub instructions: u32,
    /// Nops inserted for alignment and adjacency.
    pub nops: u32,
    /// Bytes of inserted nops.
    pub nop_bytes: CodeOffset,
    /// Branches encoded.
    pub branches: u32,
    /// Branches shortened during emission.
    pub late_shortened: u32,
    /// Delay slots filled with a scheduled instruction.
    pub delay_slots: u32,
}

/// The output of the emitter.
#[derive(Debug)]
pub struct Emission {
    /// The finished code.
    pub buffer: FinalizedCodeBuffer,
    /// Block offsets and branch forms as emitted.
    pub layout: Layout,
    /// Exception handlers per call site.
    pub exception_table: ExceptionHandlerTable,
    /// Implicit null checks and trap-based checks.
    pub null_check_table: ImplicitNullCheckTable,
    /// Handler stub offsets, for methods.
    pub handlers: HandlerOffsets,
    /// Size of the first block.
    pub first_block_size: CodeOffset,
    /// Counters.
    pub stats: EmitStats,
}

/// Encodes a laid out, scheduled function.
pub struct Emitter<'a, I: TargetIsa> {
    isa: &'a I,
    regs: &'a RegAssignment,
    flags: &'a Flags,
    constants: &'a ConstantLayout,
    bundles: &'a SecondaryMap<Inst, Bundle>,
    first_inst_sizes: &'a SecondaryMap<Block, CodeOffset>,
    layout: Layout,
    non_safepoints: NonSafepointEmitter,
    stats: EmitStats,
}

impl<'a, I: TargetIsa> Emitter<'a, I> {
    /// An emitter starting from the shortened `layout`.
    ///
    /// `bundles` comes from the scheduler; an empty map means the function was not
    /// scheduled.
    pub fn new(
        isa: &'a I,
        regs: &'a RegAssignment,
        flags: &'a Flags,
        layout: &Layout,
        constants: &'a ConstantLayout,
        bundles: &'a SecondaryMap<Inst, Bundle>,
        first_inst_sizes: &'a SecondaryMap<Block, CodeOffset>,
    ) -> Self {
        Self {
            isa,
            regs,
            flags,
            constants,
            bundles,
            first_inst_sizes,
            layout: layout.clone(),
            non_safepoints: NonSafepointEmitter::new(),
            stats: EmitStats::default(),
        }
    }

    /// Emit `func` into `buf`.
    ///
    /// Late branch shortening rewrites branch opcodes in `func`.
    pub fn emit(
        mut self,
        func: &mut Function,
        mut buf: CodeBuffer<I::LabelUse>,
        sink: &mut dyn DebugInfoSink,
    ) -> OutputResult<Emission> {
        let _tt = timing::emit();
        let isa = self.isa;
        let nblocks = func.num_blocks();
        let nop_size = isa.nop_size();
        let unit = isa.addr_unit();
        let bundling = isa.pipeline_info().requires_bundling;

        self.constants.emit_into(func, buf.consts_mut());
        buf.reserve_labels_for_blocks(nblocks);
        let end_label = buf.get_label();

        // Return address of the last call of each block.
        let mut call_returns: SecondaryMap<Block, Option<CodeOffset>> = SecondaryMap::new();
        // Faulting offset of the null or trap check ending each block.
        let mut check_offsets: SecondaryMap<Block, Option<CodeOffset>> = SecondaryMap::new();
        let mut inst_starts: SecondaryMap<Inst, Option<CodeOffset>> = SecondaryMap::new();

        // End offsets of the last non-leaf call and the last "avoid after" instruction.
        let mut last_call: Option<CodeOffset> = None;
        let mut last_avoid: Option<CodeOffset> = None;

        for i in 0..nblocks {
            let block = Block::new(i);
            if bundling
                && func.blocks[block]
                    .insts
                    .first()
                    .is_some_and(|&head| self.bundles[head].starts_bundle)
            {
                isa.flush_bundle(&mut buf, true);
            }
            let blk_offset = buf.cur_offset();
            trace!("{block} at {blk_offset:#x}");
            buf.bind_label(MachLabel::from_block(block));

            let mut delay_slot: Option<Inst> = None;
            for idx in 0..func.blocks[block].insts.len() {
                let inst = func.blocks[block].insts[idx];
                let bundle = self.bundles[inst];
                if bundle.used_in_delay {
                    debug_assert!(delay_slot.is_none());
                    delay_slot = Some(inst);
                    continue;
                }
                if bundling && bundle.starts_bundle {
                    isa.flush_bundle(&mut buf, false);
                }

                let data = &func.insts[inst];
                let opcode = data.opcode;
                let is_call = data.is_call();
                let is_mcall = data.is_non_leaf_call();
                let is_safepoint = data.is_safepoint();
                let is_branch = data.is_branch();
                let null_check = match data.kind {
                    InstKind::NullCheck { memory } => Some(memory),
                    _ => None,
                };
                let trap_check = data.flags.contains(InstFlags::TRAP_CHECK);
                let scope = data.scope.expand();
                let aligned = isa.inst_alignment(opcode) > 1;

                if bundling && (is_call || is_safepoint || aligned) {
                    isa.flush_bundle(&mut buf, true);
                }
                let mut current = buf.cur_offset();

                let mut padding = isa.compute_padding(opcode, current);
                if padding == 0 && is_safepoint && !is_call && last_call == Some(current) {
                    // Keep the safepoint off the return address of the call.
                    padding = nop_size;
                }
                if padding == 0
                    && isa.pipeline(opcode).avoid.contains(AvoidAdjacent::BEFORE)
                    && last_avoid == Some(current)
                {
                    padding = nop_size;
                }
                if padding > 0 {
                    debug_assert_eq!(padding % nop_size, 0);
                    self.emit_nops(padding / nop_size, &mut buf);
                    current = buf.cur_offset();
                }

                if is_call {
                    call_returns[block] = Some(current + isa.ret_addr_offset(func, inst));
                }
                if is_safepoint {
                    self.record_safepoint(func, inst, current, sink);
                }
                if let Some(memory) = null_check {
                    // The checked access must already be placed in this block.
                    let start = inst_starts[memory]
                        .filter(|_| func.inst_block(memory) == Some(block));
                    let Some(start) = start else {
                        return Err(OutputError::NullCheckBeforeAccess { block, inst, memory });
                    };
                    check_offsets[block] = Some(start);
                }

                let mut target = None;
                if is_branch {
                    if let Some(succ) = func.non_connector_successor(block, 0) {
                        if !bundle.use_delay {
                            current = self.late_shorten(
                                func,
                                inst,
                                block,
                                succ,
                                blk_offset,
                                current,
                                last_avoid,
                                &mut buf,
                            );
                        }
                        target = Some(succ);
                    }
                }
                if trap_check {
                    check_offsets[block] = Some(current);
                }

                buf.ensure_remaining(self.flags.max_inst_size())?;
                inst_starts[inst] = Some(current);
                let info = EmitInfo {
                    target: target.map(MachLabel::from_block),
                    constants: self.constants,
                };
                isa.emit(func, inst, self.regs, &info, &mut buf);
                if buf.is_exhausted() {
                    return Err(OutputError::CodeCacheFull);
                }
                let end = buf.cur_offset();
                self.stats.instructions += 1;
                self.non_safepoints.observe_instruction(func, scope, end, sink);

                let opcode = func.insts[inst].opcode;
                if is_branch {
                    self.stats.branches += 1;
                    if let (Some(site), Some(succ)) = (self.layout.branch(block).copied(), target)
                    {
                        if site.inst == inst {
                            self.layout.set_branch(
                                block,
                                BranchSite {
                                    inst,
                                    offset: current - blk_offset,
                                    size: end - current,
                                    opcode,
                                    target: succ,
                                },
                            );
                        }
                    }
                }
                if is_mcall {
                    last_call = Some(end);
                }
                if isa.pipeline(opcode).avoid.contains(AvoidAdjacent::AFTER) {
                    last_avoid = Some(end);
                }

                if bundle.use_delay {
                    if let Some(slot) = delay_slot.take() {
                        self.fill_delay_slot(func, slot, &mut buf, &mut inst_starts, sink)?;
                    }
                }
            }
            debug_assert!(delay_slot.is_none(), "{block} has an unused delay slot instruction");

            if let Some(next) = func.next_block(block) {
                let pad = loop_padding(
                    func.blocks[next].alignment,
                    unit,
                    buf.cur_offset(),
                    self.flags.max_loop_pad(),
                    self.first_inst_sizes[next],
                );
                if pad > 0 {
                    trace!("padding {pad} bytes before loop {next}");
                    self.emit_nops(pad / nop_size, &mut buf);
                }
            }

            let estimated = self.layout.block_size(block);
            let emitted = buf.cur_offset() - blk_offset;
            if emitted > estimated {
                return Err(OutputError::BlockSizeIncreased {
                    block,
                    estimated,
                    emitted,
                });
            }
            self.layout.set_block_start(block, blk_offset);
        }

        let code_end = buf.cur_offset();
        self.layout.set_code_end(code_end);
        self.non_safepoints.flush_at_end(func, sink);
        buf.bind_label(end_label);
        self.layout.verify_short_branches(isa)?;

        let (exception_table, null_check_table) =
            self.fill_tables(func, &call_returns, &check_offsets);

        let mut handlers = HandlerOffsets::default();
        if func.method.is_some() {
            handlers.exception = Some(isa.emit_exception_handler(&mut buf));
            handlers.deopt = Some(isa.emit_deopt_handler(&mut buf));
            if func.has_method_handle_invokes() {
                handlers.deopt_mh = Some(isa.emit_deopt_handler(&mut buf));
            }
            if buf.is_exhausted() {
                return Err(OutputError::CodeCacheFull);
            }
        }

        let first_block_size = if nblocks > 1 {
            self.layout.block_start(Block::new(1)) - self.layout.block_start(Block::new(0))
        } else {
            code_end
        };

        let buffer = {
            let _tt = timing::finish();
            buf.finish()?
        };
        debug!(
            "emitted {code_end} bytes: {} instructions, {} nops ({} bytes), {} late short branches",
            self.stats.instructions,
            self.stats.nops,
            self.stats.nop_bytes,
            self.stats.late_shortened
        );

        Ok(Emission {
            buffer,
            layout: self.layout,
            exception_table,
            null_check_table,
            handlers,
            first_block_size,
            stats: self.stats,
        })
    }

    fn emit_nops(&mut self, count: u32, buf: &mut CodeBuffer<I::LabelUse>) {
        self.isa.emit_nops(count, buf);
        self.stats.nops += count;
        self.stats.nop_bytes += count * self.isa.nop_size();
    }

    /// Switch the branch `inst` to its short form if the target is in range with the offsets
    /// known so far. Returns the offset the branch will be emitted at.
    ///
    /// Blocks before the current one have their final offsets. The current block and the ones
    /// after it still have their shortened offsets, which are off by the same amount the
    /// current block has moved.
    #[allow(clippy::too_many_arguments, reason = "emission state of the current block")]
    fn late_shorten(
        &mut self,
        func: &mut Function,
        inst: Inst,
        block: Block,
        target: Block,
        blk_offset: CodeOffset,
        current: CodeOffset,
        last_avoid: Option<CodeOffset>,
        buf: &mut CodeBuffer<I::LabelUse>,
    ) -> CodeOffset {
        let isa = self.isa;
        let opcode = func.insts[inst].opcode;
        let Some(short) = isa.short_branch_version(opcode) else {
            return current;
        };
        let br_size = isa.inst_size(func, inst, opcode, self.regs);
        let mut offset = i64::from(self.layout.block_start(target)) - i64::from(current);
        if target.index() >= block.index() {
            offset -= i64::from(self.layout.block_start(block)) - i64::from(blk_offset);
        }
        // A nop may go in front of the branch, which lengthens a backward jump.
        let needs_padding = last_avoid == Some(current);
        if needs_padding && offset <= 0 {
            offset -= i64::from(isa.nop_size());
        }
        if !isa.is_short_branch_offset(short, br_size, offset) {
            return current;
        }

        let mut current = current;
        if needs_padding && isa.pipeline(short).avoid.contains(AvoidAdjacent::BEFORE) {
            self.emit_nops(1, buf);
            if isa.pipeline_info().requires_bundling {
                isa.flush_bundle(buf, true);
            }
            current = buf.cur_offset();
        }
        trace!("late shortening {inst}: {opcode} -> {short}, displacement {offset}");
        func.insts[inst].opcode = short;
        self.stats.late_shortened += 1;
        current
    }

    /// Back up over the nop of the branch just emitted and put `slot` there.
    fn fill_delay_slot(
        &mut self,
        func: &Function,
        slot: Inst,
        buf: &mut CodeBuffer<I::LabelUse>,
        inst_starts: &mut SecondaryMap<Inst, Option<CodeOffset>>,
        sink: &mut dyn DebugInfoSink,
    ) -> OutputResult<()> {
        let isa = self.isa;
        let unit = isa.pipeline_info().instr_unit_size.unwrap_or(isa.nop_size());
        buf.back_up(unit);
        let offset = buf.cur_offset();
        if func.insts[slot].is_safepoint() {
            self.record_safepoint(func, slot, offset, sink);
        }
        inst_starts[slot] = Some(offset);
        let info = EmitInfo {
            target: None,
            constants: self.constants,
        };
        isa.emit(func, slot, self.regs, &info, buf);
        if buf.is_exhausted() {
            return Err(OutputError::CodeCacheFull);
        }
        trace!("{slot} fills the delay slot at {offset:#x}");
        self.stats.instructions += 1;
        self.stats.delay_slots += 1;
        Ok(())
    }

    /// Describe the safepoint `inst` emitted at `offset` to the sink.
    fn record_safepoint(
        &mut self,
        func: &Function,
        inst: Inst,
        offset: CodeOffset,
        sink: &mut dyn DebugInfoSink,
    ) {
        let data = &func.insts[inst];
        let Some(sp) = data.safepoint_data() else {
            return;
        };
        let scope = sp.scope.expand();
        let (pc, info) = match &data.kind {
            InstKind::Call(call) => (
                offset + self.isa.ret_addr_offset(func, inst),
                SafepointInfo {
                    method_handle_invoke: call.method_handle_invoke,
                    return_oop: call.returns_oop,
                },
            ),
            _ if scope.is_none_or(|s| func.scopes[s].method.is_none()) => {
                // Stub code: only the root map.
                trace!("root map for {inst} at {offset:#x}");
                sink.add_safepoint(offset, &sp.oop_map);
                sink.end_safepoint(offset);
                return;
            }
            _ => (offset, SafepointInfo::default()),
        };

        self.non_safepoints.observe_safepoint(func, scope, offset, sink);
        sink.add_safepoint(pc, &sp.oop_map);
        if let Some(scope) = scope {
            debuginfo::describe_scopes(func, self.regs, scope, pc, info, sink);
        }
        sink.end_safepoint(pc);
    }

    fn fill_tables(
        &self,
        func: &Function,
        call_returns: &SecondaryMap<Block, Option<CodeOffset>>,
        check_offsets: &SecondaryMap<Block, Option<CodeOffset>>,
    ) -> (ExceptionHandlerTable, ImplicitNullCheckTable) {
        let _tt = timing::exception_tables();
        let mut handler_table = ExceptionHandlerTable::new();
        let mut inc_table = ImplicitNullCheckTable::new();

        for (block, data) in func.blocks.iter() {
            // Trailing nops do not count.
            let Some(&last) = data
                .insts
                .iter()
                .rev()
                .find(|&&i| !matches!(func.insts[i].kind, InstKind::Nop))
            else {
                continue;
            };
            let last = &func.insts[last];

            if let InstKind::Catch(bcis) = &last.kind {
                debug_assert!(call_returns[block].is_some(), "{block} catches without a call");
                let Some(return_pc) = call_returns[block] else {
                    continue;
                };
                let mut entries: SmallVec<[HandlerEntry; 4]> = SmallVec::new();
                for (j, bci) in bcis.iter().enumerate() {
                    let Some(bci) = *bci else { continue };
                    if entries.iter().any(|e| e.bci == bci) {
                        continue;
                    }
                    if let Some(handler) = func.non_connector_successor(block, j) {
                        entries.push(HandlerEntry {
                            bci,
                            pc: self.layout.block_start(handler),
                        });
                    }
                }
                trace!(
                    "{block}: {} handlers for the call returning at {return_pc:#x}",
                    entries.len()
                );
                handler_table.add_subtable(return_pc, &entries);
            } else if matches!(last.kind, InstKind::NullCheck { .. })
                || last.flags.contains(InstFlags::TRAP_CHECK)
            {
                if let (Some(exec), Some(handler)) =
                    (check_offsets[block], func.non_connector_successor(block, 0))
                {
                    inc_table.append(exec, self.layout.block_start(handler));
                }
            }
        }

        debug!(
            "{} call sites with handlers, {} implicit checks",
            handler_table.len(),
            inc_table.len()
        );
        (handler_table, inc_table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SectionSizes;
    use crate::debuginfo::DebugInfoRecorder;
    use crate::isa::toy::{self, ToyIsa, gpr, opcodes::*};
    use crate::sched::schedule_function;

    fn code_buffer<I: TargetIsa>(insts: usize) -> CodeBuffer<I::LabelUse> {
        CodeBuffer::new(SectionSizes {
            consts: 64,
            insts,
            stubs: 64,
        })
    }

    #[test]
    fn constants_are_aligned() {
        let mut func = Function::new(None);
        let a = func.add_constant(&[1, 2, 3], 1);
        let b = func.add_constant(&7u64.to_le_bytes(), 8);
        let c = func.add_constant(&[9], 2);
        let layout = ConstantLayout::compute(&func);
        assert_eq!(layout.offset(a), 0);
        assert_eq!(layout.offset(b), 8);
        assert_eq!(layout.offset(c), 16);
        assert_eq!(layout.size(), 17);

        let mut section = Section::with_capacity(32);
        layout.emit_into(&func, &mut section);
        assert_eq!(section.data()[..3], [1, 2, 3]);
        assert_eq!(section.data()[8], 7);
        assert_eq!(section.data()[16], 9);
        assert!(!section.overflowed());
    }

    #[test]
    fn loop_padding_limits() {
        // 15 bytes of padding exceed the limit of 11. It is still added unless the first
        // instructions of the loop fit in what is left of the fetch window.
        assert_eq!(loop_padding(16, 1, 17, 11, CodeOffset::MAX), 15);
        assert_eq!(loop_padding(16, 1, 17, 11, 14), 0);
        assert_eq!(loop_padding(16, 1, 17, 11, 16), 15);
        assert_eq!(loop_padding(16, 1, 20, 11, 14), 12);
        assert_eq!(loop_padding(16, 1, 24, 11, 4), 8);
        assert_eq!(loop_padding(16, 1, 32, 11, 4), 0);
        assert_eq!(loop_padding(0, 1, 17, 11, 4), 0);
        assert_eq!(loop_padding(16, 4, 20, 4, CodeOffset::MAX), 12);
    }

    #[test]
    fn first_instructions_of_loops() {
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b0 = fb.block();
        let b1 = fb.block();
        let b2 = fb.block();
        let b3 = fb.block();
        fb.ins(b0, LOAD, &[], Some(gpr(1)));
        // Three 3-byte loads, then a fall-through block whose back branch ends the count.
        fb.align(b1, 16);
        for _ in 0..3 {
            fb.ins(b1, LOAD, &[], Some(gpr(1)));
        }
        fb.succs(b1, &[b2]);
        fb.ins_kind(b2, JMP, InstKind::Branch { conditional: false }, &[], None);
        fb.succs(b2, &[b1]);
        // Constant loads overflow the window after two.
        fb.align(b3, 16);
        for _ in 0..4 {
            fb.ins(b3, LOAD_CONST, &[], Some(gpr(2)));
        }
        let (func, regs) = fb.finish();

        let sizes = loop_first_inst_sizes(&func, &isa, &regs, &Flags::default());
        assert_eq!(sizes[b0], CodeOffset::MAX);
        assert_eq!(sizes[b1], 3 + 3 + 3 + 5);
        assert_eq!(sizes[b2], CodeOffset::MAX);
        assert_eq!(sizes[b3], 12);
    }

    #[test]
    fn back_branch_shortened_late() {
        let _ = env_logger::try_init();
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b0 = fb.block();
        let b1 = fb.block();
        let b2 = fb.block();
        fb.ins(b0, LOAD, &[], Some(gpr(1)));
        fb.ins(b1, LOAD, &[], Some(gpr(1)));
        let jmp = fb.ins_kind(b1, JMP, InstKind::Branch { conditional: false }, &[], None);
        fb.succs(b1, &[b0]);
        fb.ins_kind(b2, RET, InstKind::Return, &[], None);
        let (mut func, regs) = fb.finish();

        // Emit straight from the estimate, without shortening first.
        let estimate = Layout::estimate(&func, &isa, &regs).unwrap();
        assert_eq!(estimate.block_starts(), &[0, 3, 11, 12]);
        let flags = Flags::default();
        let constants = ConstantLayout::default();
        let bundles = SecondaryMap::new();
        let first = SecondaryMap::with_default(CodeOffset::MAX);
        let emitter = Emitter::new(&isa, &regs, &flags, &estimate, &constants, &bundles, &first);
        let mut sink = DebugInfoRecorder::new();
        let out = emitter
            .emit(&mut func, code_buffer::<ToyIsa>(1024), &mut sink)
            .unwrap();

        assert_eq!(func.insts[jmp].opcode, JMP_SHORT);
        assert_eq!(out.stats.late_shortened, 1);
        assert_eq!(out.layout.block_starts(), &[0, 3, 8, 9]);
        assert_eq!(out.layout.branch(b1).unwrap().opcode, JMP_SHORT);
        assert_eq!(out.first_block_size, 3);
        // jmp at 6, displacement from its end back to 0.
        assert_eq!(out.buffer.insts()[6..8], [0xeb, (-8i8) as u8]);
        assert_eq!(out.handlers, HandlerOffsets::default());
    }

    #[test]
    fn delay_slot_is_emitted_after_branch() {
        let _ = env_logger::try_init();
        let isa = ToyIsa::risc();
        let mut fb = toy::builder(Some(crate::ir::MethodRef::new(0)));
        let b0 = fb.block();
        let b1 = fb.block();
        let b2 = fb.block();
        let a = fb.ins(b0, LOAD, &[], Some(gpr(2)));
        let cmp = fb.ins(b0, CMP, &[], Some(toy::flags()));
        fb.ins_kind(b0, JCC, InstKind::Branch { conditional: true }, &[cmp], None);
        fb.flags(cmp, InstFlags::COMPARE);
        fb.succs(b0, &[b2, b1]);
        fb.ins_kind(b1, RET, InstKind::Return, &[], None);
        fb.ins_kind(b2, RET, InstKind::Return, &[], None);
        let (mut func, regs) = fb.finish();

        let flags = Flags::default();
        let layout = Layout::estimate(&func, &isa, &regs).unwrap().shorten(&func, &isa, &regs);
        let schedule = schedule_function(&mut func, &isa, &regs, &flags).unwrap();
        assert!(schedule.bundles[a].used_in_delay);
        let constants = ConstantLayout::compute(&func);
        let first = loop_first_inst_sizes(&func, &isa, &regs, &flags);
        let emitter = Emitter::new(
            &isa,
            &regs,
            &flags,
            &layout,
            &constants,
            &schedule.bundles,
            &first,
        );
        let mut sink = DebugInfoRecorder::new();
        let out = emitter
            .emit(&mut func, code_buffer::<ToyIsa>(1024), &mut sink)
            .unwrap();

        // cmp, branch word, load in the slot, then the two returns.
        let code = out.buffer.insts();
        assert_eq!(code.len(), 20);
        assert_eq!(code[..4], [CMP.0 as u8, 16, 0, 0]);
        assert_eq!(code[4..12], [JCC.0 as u8, 0, 8, 0, LOAD.0 as u8, 2, 0, 0]);
        assert_eq!(out.layout.block_starts(), &[0, 12, 16, 20]);
        assert_eq!(out.stats.delay_slots, 1);
        assert_eq!(out.stats.instructions, 5);
        assert!(out.handlers.exception.is_some());
        assert!(out.handlers.deopt.is_some());
        assert_eq!(out.handlers.deopt_mh, None);
    }

    #[test]
    fn growing_block_is_reported() {
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b0 = fb.block();
        let b1 = fb.block();
        fb.ins(b0, LOAD, &[], Some(gpr(1)));
        fb.ins_kind(b1, RET, InstKind::Return, &[], None);
        let (mut func, regs) = fb.finish();
        let layout = Layout::estimate(&func, &isa, &regs).unwrap();

        // A register change after layout makes the load need its prefix byte.
        let mut regs = regs;
        regs.assign(func.blocks[b0].insts[0], crate::ir::RegPair::single(gpr(9)));
        let flags = Flags::default();
        let constants = ConstantLayout::default();
        let bundles = SecondaryMap::new();
        let first = SecondaryMap::with_default(CodeOffset::MAX);
        let emitter = Emitter::new(&isa, &regs, &flags, &layout, &constants, &bundles, &first);
        let err = emitter
            .emit(&mut func, code_buffer::<ToyIsa>(1024), &mut DebugInfoRecorder::new())
            .unwrap_err();
        assert_eq!(
            err,
            OutputError::BlockSizeIncreased {
                block: b0,
                estimated: 3,
                emitted: 4
            }
        );
    }

    #[test]
    fn null_check_needs_its_access_first() {
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b0 = fb.block();
        let b1 = fb.block();
        let b2 = fb.block();
        let x = fb.ins(b0, LOAD, &[], Some(gpr(1)));
        let check = fb.ins_kind(b0, NULL_CHECK, InstKind::NullCheck { memory: x }, &[x], None);
        fb.succs(b0, &[b2, b1]);
        fb.ins_kind(b1, RET, InstKind::Return, &[], None);
        fb.ins_kind(b2, RET, InstKind::Return, &[], None);
        let (mut func, regs) = fb.finish();
        let layout = Layout::estimate(&func, &isa, &regs).unwrap();
        func.blocks[b0].insts = [check, x].into_iter().collect();

        let flags = Flags::default();
        let constants = ConstantLayout::default();
        let bundles = SecondaryMap::new();
        let first = SecondaryMap::with_default(CodeOffset::MAX);
        let emitter = Emitter::new(&isa, &regs, &flags, &layout, &constants, &bundles, &first);
        let err = emitter
            .emit(&mut func, code_buffer::<ToyIsa>(1024), &mut DebugInfoRecorder::new())
            .unwrap_err();
        assert_eq!(
            err,
            OutputError::NullCheckBeforeAccess {
                block: b0,
                inst: check,
                memory: x
            }
        );
    }
}
