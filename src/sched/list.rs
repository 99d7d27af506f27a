//! The bottom-up list scheduler.
//!
//! A block's window is scheduled from its last instruction to its first. An instruction
//! becomes available once every instruction depending on it has been placed. Among the
//! available ones, the scheduler fills the current issue bundle with those whose latency has
//! elapsed and whose functional units are free, and steps to the next cycle when nothing else
//! fits.

use crate::entity::SecondaryMap;
use crate::ir::{Block, Function, Inst, InstFlags, InstKind, Pipeline, RegAssignment};
use crate::isa::TargetIsa;
use crate::result::{OutputError, OutputResult};
use crate::sched::antidep::{PinchPool, add_anti_dependences};
use crate::sched::{Bundle, BundleUse, DepGraph, DepKind, Node, NodeMap, Schedule, ScheduleStats};
use crate::settings::Flags;
use crate::timing;
use core::ops::Range;
use smallvec::SmallVec;

/// Scheduling state of the block being scheduled.
struct BlockState {
    graph: DepGraph,
    uses: NodeMap<u32>,
    latency: NodeMap<u32>,
    available: Vec<Node>,
    scheduled: Vec<Node>,
    delay_slot: Option<Inst>,
}

/// The list scheduler for one function.
///
/// Bundle state carries over from a block to its layout predecessor when control simply falls
/// into the block.
pub struct ListScheduler<'a, I: TargetIsa> {
    isa: &'a I,
    regs: &'a RegAssignment,
    consumers: SecondaryMap<Inst, u32>,
    pool: PinchPool,
    bundles: SecondaryMap<Inst, Bundle>,
    bundle_use: BundleUse,
    cycle: u32,
    instr_count: u32,
    next_node: Option<Inst>,
    stats: ScheduleStats,
}

impl<'a, I: TargetIsa> ListScheduler<'a, I> {
    /// A scheduler for a function whose results have `consumers` readers each.
    pub fn new(
        isa: &'a I,
        regs: &'a RegAssignment,
        flags: &Flags,
        consumers: SecondaryMap<Inst, u32>,
    ) -> Self {
        Self {
            isa,
            regs,
            consumers,
            pool: PinchPool::new(flags.max_pinch_points()),
            bundles: SecondaryMap::new(),
            bundle_use: BundleUse::new(),
            cycle: 0,
            instr_count: 0,
            next_node: None,
            stats: ScheduleStats::default(),
        }
    }

    /// Close the last bundle and return the bundling records.
    pub fn finish(mut self) -> Schedule {
        self.step_and_clear();
        Schedule {
            bundles: self.bundles,
            stats: self.stats,
        }
    }

    fn pipeline(&self, func: &Function, inst: Inst) -> &'a Pipeline {
        let isa = self.isa;
        isa.pipeline(func.insts[inst].opcode)
    }

    fn size(&self, func: &Function, inst: Inst) -> u32 {
        self.isa
            .inst_size(func, inst, func.insts[inst].opcode, self.regs)
    }

    /// Issue slots taken by `n`. Pinch points and empty instructions take none.
    fn instruction_count(&self, func: &Function, n: Node) -> u32 {
        let Node::Inst(inst) = n else { return 0 };
        let pipe = self.pipeline(func, inst);
        if pipe.may_have_no_code && self.size(func, inst) == 0 {
            0
        } else {
            pipe.instruction_count
        }
    }

    /// The range of `block`'s instructions the scheduler may reorder.
    ///
    /// Pinned instructions at the head stay put, as do trailing nops and the instructions
    /// tied to the block end: a catch and its call, a halt and a call right before it, and a
    /// null check together with its memory access.
    pub fn window(&self, func: &Function, block: Block) -> Range<usize> {
        let insts = &func.blocks[block].insts;
        let mut start = 0;
        while start < insts.len() && func.insts[insts[start]].flags.contains(InstFlags::PINNED) {
            start += 1;
        }
        let mut end = insts.len();
        while end > start && matches!(func.insts[insts[end - 1]].kind, InstKind::Nop) {
            end -= 1;
        }
        if end == start {
            return start..start;
        }

        let last = end - 1;
        let end = match &func.insts[insts[last]].kind {
            InstKind::Catch(_) => {
                if start < last {
                    last - 1
                } else {
                    last
                }
            }
            InstKind::Halt => {
                if start < last && func.insts[insts[last - 1]].is_call() {
                    last - 1
                } else {
                    last
                }
            }
            InstKind::NullCheck { memory } => insts[start..last]
                .iter()
                .rposition(|i| i == memory)
                .map_or(last, |pos| start + pos),
            _ => end,
        };
        start..end
    }

    /// Schedule `block`, returning the window and its new order, if there was anything to do.
    pub fn schedule_block(
        &mut self,
        func: &Function,
        block: Block,
    ) -> OutputResult<Option<(Range<usize>, Vec<Inst>)>> {
        let data = &func.blocks[block];
        if data.succs.len() != 1 || func.non_connector_successor(block, 0) != func.next_block(block)
        {
            self.step_and_clear();
        }

        let window = self.window(func, block);
        if window.is_empty() {
            return Ok(None);
        }
        self.stats.blocks += 1;

        let mut graph = DepGraph::new(func, block, &data.insts[window.clone()]);
        let pinches = {
            let _tt = timing::anti_dependences();
            add_anti_dependences(func, self.regs, &self.consumers, &mut self.pool, &mut graph)?
        };
        self.stats.pinch_points += pinches.len() as u32;

        let mut st = BlockState {
            graph,
            uses: NodeMap::new(),
            latency: NodeMap::new(),
            available: Vec::new(),
            scheduled: Vec::new(),
            delay_slot: None,
        };
        self.compute_use_count(func, &mut st);

        // Control flow leaves the block last, even when the successor's bundle still holds
        // its unit. It is placed before anything else and never goes through `choose`.
        let last = data.insts[window.end - 1];
        let mut first = func.insts[last].is_block_end().then_some(Node::Inst(last));
        let misplaced = first.is_some_and(|n| !st.available.contains(&n));
        if misplaced {
            first = None;
        }
        while !misplaced && !st.available.is_empty() {
            let n = first.take().unwrap_or_else(|| self.choose(func, &st));
            self.add_node_to_bundle(func, &mut st, n);
        }

        let total = st.graph.nodes().len();
        for p in pinches {
            self.pool.free(p);
        }
        if misplaced {
            log::debug!("{last} ends {block} but other instructions depend on it");
            return Err(OutputError::BadSchedule { block, inst: last });
        }
        if st.scheduled.len() != total {
            return Err(OutputError::ScheduleStalled {
                block,
                remaining: total - st.scheduled.len(),
            });
        }

        let order: Vec<Inst> = st.scheduled.iter().rev().filter_map(|n| n.inst()).collect();
        trace!("{block} scheduled as {order:?}");
        self.stats.instructions += order.len() as u32;
        Ok(Some((window, order)))
    }

    fn compute_use_count(&self, func: &Function, st: &mut BlockState) {
        let nodes = st.graph.nodes().to_vec();
        for &n in &nodes {
            for dep in st.graph.preds(n) {
                if st.graph.contains(dep.node) {
                    st.uses[dep.node] += 1;
                }
            }
        }
        for &n in nodes.iter().rev() {
            if st.uses[n] == 0 {
                st.latency[n] = self.cycle;
                self.add_to_available(func, st, n);
            }
        }
    }

    /// Insert `n` into the available list, ordered by latency.
    fn add_to_available(&self, func: &Function, st: &mut BlockState, n: Node) {
        let latency = st.latency[n];
        let mut pos = st
            .available
            .iter()
            .position(|&m| st.latency[m] > latency)
            .unwrap_or(st.available.len());

        // A compare goes first among equals when it feeds the block's final branch.
        if let Node::Inst(inst) = n {
            let feeds_branch = match st.scheduled.first() {
                Some(&Node::Inst(br)) => {
                    let br = &func.insts[br];
                    br.is_conditional_branch() && br.inputs.first() == Some(&inst)
                }
                _ => false,
            };
            if feeds_branch && func.insts[inst].flags.contains(InstFlags::COMPARE) {
                pos = st
                    .available
                    .iter()
                    .position(|&m| st.latency[m] >= latency)
                    .unwrap_or(st.available.len());
            }
        }
        st.available.insert(pos, n);
    }

    /// Can `n` join the current bundle?
    fn fits(&self, func: &Function, st: &BlockState, n: Node) -> bool {
        if st.latency[n] > self.cycle {
            return false;
        }
        let Node::Inst(inst) = n else { return false };
        let pipe = self.pipeline(func, inst);
        let mut count = pipe.instruction_count;
        if pipe.may_have_no_code && self.size(func, inst) == 0 {
            count = 0;
        } else if pipe.has_branch_delay && st.delay_slot.is_none() {
            count += 1;
        }
        if self.instr_count + count > self.isa.pipeline_info().max_instrs_per_cycle {
            return false;
        }
        self.bundle_use.full_latency(0, pipe) == 0
    }

    fn nop_fits(&self) -> bool {
        let nop = self.isa.pipeline(self.isa.nop_opcode());
        self.instr_count + nop.instruction_count <= self.isa.pipeline_info().max_instrs_per_cycle
            && self.bundle_use.full_latency(0, nop) == 0
    }

    fn choose(&self, func: &Function, st: &BlockState) -> Node {
        if st.available.len() > 1
            && self.instr_count < self.isa.pipeline_info().max_instrs_per_cycle
        {
            if let Some(&n) = st.available.iter().find(|&&n| self.fits(func, st, n)) {
                return n;
            }
        }
        st.available[0]
    }

    /// Look for an available instruction to put in the delay slot of `branch`.
    fn find_delay_slot(&self, func: &Function, st: &BlockState, branch: Inst) -> Option<Inst> {
        if !func.insts[branch].is_branch() {
            return None;
        }
        let unit = self.isa.pipeline_info().instr_unit_size?;
        st.available.iter().find_map(|&d| {
            let inst = d.inst()?;
            let pipe = self.pipeline(func, inst);
            let ok = pipe.instruction_count == 1
                && !pipe.has_multiple_bundles
                && !pipe.has_branch_delay
                && self.size(func, inst) == unit
                && self.fits(func, st, d)
                && !self.bundles[inst].used_in_delay
                && !func.insts[inst].is_safepoint();
            ok.then_some(inst)
        })
    }

    fn add_node_to_bundle(&mut self, func: &Function, st: &mut BlockState, n: Node) {
        if let Some(pos) = st.available.iter().position(|&m| m == n) {
            st.available.remove(pos);
        }
        let pipe = n.inst().map(|i| self.pipeline(func, i));
        let max = self.isa.pipeline_info().max_instrs_per_cycle;

        if let (Node::Inst(branch), Some(p)) = (n, pipe) {
            if p.has_branch_delay && self.isa.pipeline_info().branch_has_delay_slot {
                self.stats.branches += 1;
                if let Some(d) = self.find_delay_slot(func, st, branch) {
                    trace!("{d} fills the delay slot of {branch}");
                    self.bundles[branch].use_delay = true;
                    self.bundles[d].used_in_delay = true;
                    let slot = self.pipeline(func, d);
                    self.bundle_use.add_usage(slot);
                    st.latency[Node::Inst(d)] = self.cycle;
                    self.instr_count += 1;
                    self.stats.delay_slots_filled += 1;
                    st.available.retain(|&m| m != Node::Inst(d));
                    st.delay_slot = Some(d);
                } else {
                    if !self.nop_fits() {
                        self.step(1);
                    }
                    let nop = self.isa.pipeline(self.isa.nop_opcode());
                    self.bundle_use.add_usage(nop);
                    self.instr_count += 1;
                }
                if !self.fits(func, st, n) {
                    self.instr_count = 0;
                    self.cycle += 1;
                    self.bundle_use.step(1);
                }
            }
        }

        let count = self.instruction_count(func, n);
        let mut delay = 0;
        if let Some(p) = pipe {
            if count > 0 || !p.may_have_no_code {
                let relative = st.latency[n].saturating_sub(self.cycle);
                delay = self.bundle_use.full_latency(relative, p);
                if delay > 0 {
                    self.step(delay);
                }
            }
        }
        if delay == 0 {
            if pipe.is_some_and(|p| p.has_multiple_bundles) || count + self.instr_count > max {
                self.step(1);
            }
        }

        st.latency[n] = self.cycle;
        if let Some(p) = pipe {
            if count > 0 || !p.may_have_no_code {
                self.bundle_use.add_usage(p);
            }
        }
        self.instr_count += count;
        if let Node::Inst(inst) = n {
            self.next_node = Some(inst);
        }

        st.scheduled.push(n);
        self.decrement_use_counts(func, st, n);
        if let Some(d) = st.delay_slot.take() {
            st.scheduled.push(Node::Inst(d));
            self.decrement_use_counts(func, st, Node::Inst(d));
        }
    }

    fn decrement_use_counts(&self, func: &Function, st: &mut BlockState, n: Node) {
        let preds: SmallVec<[_; 8]> = st.graph.preds(n).iter().copied().collect();
        for dep in preds {
            if !st.graph.contains(dep.node) {
                continue;
            }
            let edge_latency = match (n, dep.kind, dep.node) {
                (Node::Inst(user), DepKind::Operand(k), Node::Inst(def)) => self
                    .pipeline(func, user)
                    .operand_latency(k, self.pipeline(func, def)),
                _ => 0,
            };
            let l = self.cycle + edge_latency;
            if st.latency[dep.node] < l {
                st.latency[dep.node] = l;
            }
            debug_assert!(st.uses[dep.node] > 0, "{:?} released twice", dep.node);
            st.uses[dep.node] -= 1;
            if st.uses[dep.node] == 0 {
                self.add_to_available(func, st, dep.node);
            }
        }
    }

    fn close_bundle(&mut self) {
        if let Some(n) = self.next_node {
            let b = &mut self.bundles[n];
            b.starts_bundle = true;
            if self.instr_count > 0 {
                b.instr_count = self.instr_count;
                b.resources_used = self.bundle_use.resources_used();
                self.stats.bundles += 1;
            }
        }
    }

    /// Move to a later cycle.
    fn step(&mut self, cycles: u32) {
        self.close_bundle();
        self.instr_count = 0;
        self.cycle += cycles;
        self.bundle_use.step(cycles);
    }

    /// Close the bundle and forget all reservations, at a block boundary.
    fn step_and_clear(&mut self) {
        self.close_bundle();
        if self.instr_count > 0 {
            self.cycle += 1;
        }
        self.instr_count = 0;
        self.bundle_use.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::InstKind;
    use crate::isa::toy::{self, ToyIsa, gpr, opcodes::*};
    use crate::sched::schedule_function;
    use proptest::prelude::*;

    fn position(func: &Function, block: Block, inst: Inst) -> usize {
        func.blocks[block]
            .insts
            .iter()
            .position(|&i| i == inst)
            .unwrap()
    }

    #[test]
    fn register_reuse_keeps_reader_first() {
        let _ = env_logger::try_init();
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b = fb.block();
        let x = fb.ins(b, LOAD, &[], Some(gpr(1)));
        let z = fb.ins(b, STORE, &[x], None);
        let y = fb.ins(b, LOAD, &[], Some(gpr(1)));
        let w = fb.ins(b, STORE, &[y], None);
        fb.ins_kind(b, RET, InstKind::Return, &[], None);
        let (mut func, regs) = fb.finish();

        schedule_function(&mut func, &isa, &regs, &Flags::default()).unwrap();
        assert!(position(&func, b, x) < position(&func, b, z));
        assert!(position(&func, b, z) < position(&func, b, y));
        assert!(position(&func, b, y) < position(&func, b, w));
    }

    #[test]
    fn windows() {
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b0 = fb.block();
        let b1 = fb.block();
        let b2 = fb.block();
        let b3 = fb.block();
        let pinned = fb.ins(b0, MOV, &[], Some(gpr(1)));
        fb.flags(pinned, InstFlags::PINNED);
        fb.ins(b0, ADD, &[pinned], Some(gpr(2)));
        fb.ins_kind(b0, NOP, InstKind::Nop, &[], None);
        fb.ins(b1, MOV, &[], Some(gpr(1)));
        fb.ins_kind(b1, CALL, InstKind::Call(Default::default()), &[], None);
        fb.ins_kind(b1, CATCH, InstKind::Catch(Default::default()), &[], None);
        let mem = fb.ins(b2, LOAD, &[], Some(gpr(3)));
        fb.ins(b2, ADD, &[mem], Some(gpr(3)));
        fb.ins_kind(b2, NULL_CHECK, InstKind::NullCheck { memory: mem }, &[], None);
        fb.ins_kind(b3, NOP, InstKind::Nop, &[], None);
        let (func, regs) = fb.finish();

        let flags = Flags::default();
        let s = ListScheduler::new(&isa, &regs, &flags, func.consumer_counts());
        assert_eq!(s.window(&func, b0), 1..2);
        assert_eq!(s.window(&func, b1), 0..1);
        assert_eq!(s.window(&func, b2), 0..0);
        assert_eq!(s.window(&func, b3), 0..0);
    }

    #[test]
    fn empty_window_is_untouched() {
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b = fb.block();
        fb.ins_kind(b, NOP, InstKind::Nop, &[], None);
        let (func, regs) = fb.finish();
        let flags = Flags::default();
        let mut s = ListScheduler::new(&isa, &regs, &flags, func.consumer_counts());
        assert_eq!(s.schedule_block(&func, b).unwrap(), None);
        assert_eq!(s.finish().stats.blocks, 0);
    }

    #[test]
    fn jump_stays_last_after_fall_through() {
        let _ = env_logger::try_init();
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b0 = fb.block();
        let b1 = fb.block();
        let x = fb.ins(b0, LOAD, &[], Some(gpr(1)));
        let st = fb.ins(b0, STORE, &[x], None);
        let jmp = fb.ins_kind(b0, JMP, InstKind::Branch { conditional: false }, &[], None);
        fb.succs(b0, &[b1]);
        // Scheduled first, the return leaves the branch unit busy for the jump.
        fb.ins_kind(b1, RET, InstKind::Return, &[], None);
        let (mut func, regs) = fb.finish();

        schedule_function(&mut func, &isa, &regs, &Flags::default()).unwrap();
        assert_eq!(func.blocks[b0].insts.as_slice(), &[x, st, jmp]);
    }

    #[test]
    fn block_end_with_dependents_is_rejected() {
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b = fb.block();
        let a = fb.ins(b, STORE, &[], None);
        let ret = fb.ins_kind(b, RET, InstKind::Return, &[], None);
        fb.prec(a, ret);
        let (func, regs) = fb.finish();
        let flags = Flags::default();
        let mut s = ListScheduler::new(&isa, &regs, &flags, func.consumer_counts());
        assert_eq!(
            s.schedule_block(&func, b).unwrap_err(),
            OutputError::BadSchedule { block: b, inst: ret }
        );
    }

    #[test]
    fn cycle_stalls() {
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b = fb.block();
        let a = fb.ins(b, STORE, &[], None);
        let c = fb.ins(b, STORE, &[], None);
        fb.prec(a, c).prec(c, a);
        let (func, regs) = fb.finish();
        let flags = Flags::default();
        let mut s = ListScheduler::new(&isa, &regs, &flags, func.consumer_counts());
        assert_eq!(
            s.schedule_block(&func, b).unwrap_err(),
            OutputError::ScheduleStalled {
                block: b,
                remaining: 2
            }
        );
    }

    #[test]
    fn delay_slot_is_filled() {
        let _ = env_logger::try_init();
        let isa = ToyIsa::risc();
        let mut fb = toy::builder(None);
        let b0 = fb.block();
        let b1 = fb.block();
        let b2 = fb.block();
        let a = fb.ins(b0, LOAD, &[], Some(gpr(2)));
        let cmp = fb.ins(b0, CMP, &[], Some(toy::flags()));
        let br = fb.ins_kind(b0, JCC, InstKind::Branch { conditional: true }, &[cmp], None);
        fb.flags(cmp, InstFlags::COMPARE);
        fb.succs(b0, &[b2, b1]);
        fb.ins_kind(b1, RET, InstKind::Return, &[], None);
        fb.ins_kind(b2, RET, InstKind::Return, &[], None);
        let (mut func, regs) = fb.finish();

        let sched = schedule_function(&mut func, &isa, &regs, &Flags::default()).unwrap();
        assert!(sched.bundles[br].use_delay);
        assert!(sched.bundles[a].used_in_delay);
        assert_eq!(sched.stats.delay_slots_filled, 1);
        assert_eq!(sched.stats.branches, 1);
        assert_eq!(func.blocks[b0].insts.as_slice(), &[cmp, a, br]);
    }

    #[test]
    fn compare_goes_first_among_equals() {
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b = fb.block();
        let y = fb.ins(b, MOV, &[], Some(gpr(3)));
        let z = fb.ins(b, MOV, &[], Some(gpr(4)));
        let cmp = fb.ins(b, CMP, &[], Some(toy::flags()));
        let br = fb.ins_kind(b, JCC, InstKind::Branch { conditional: true }, &[cmp], None);
        fb.flags(cmp, InstFlags::COMPARE);
        let (func, regs) = fb.finish();
        let flags = Flags::default();
        let s = ListScheduler::new(&isa, &regs, &flags, func.consumer_counts());

        let insts = func.blocks[b].insts.clone();
        let mut st = BlockState {
            graph: DepGraph::new(&func, b, &insts),
            uses: NodeMap::new(),
            latency: NodeMap::new(),
            available: vec![Node::Inst(y)],
            scheduled: vec![Node::Inst(br)],
            delay_slot: None,
        };
        for n in [y, z, cmp] {
            st.latency[Node::Inst(n)] = 1;
        }
        s.add_to_available(&func, &mut st, Node::Inst(z));
        s.add_to_available(&func, &mut st, Node::Inst(cmp));
        assert_eq!(st.available, [Node::Inst(cmp), Node::Inst(y), Node::Inst(z)]);
    }

    #[test]
    fn latency_orders_available() {
        let _ = env_logger::try_init();
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(None);
        let b = fb.block();
        let ld = fb.ins(b, LOAD, &[], Some(gpr(1)));
        let mv = fb.ins(b, MOV, &[], Some(gpr(2)));
        let add = fb.ins(b, ADD, &[mv], Some(gpr(3)));
        let st = fb.ins(b, STORE, &[ld, add], None);
        fb.ins_kind(b, RET, InstKind::Return, &[], None);
        let (mut func, regs) = fb.finish();

        schedule_function(&mut func, &isa, &regs, &Flags::default()).unwrap();
        // The load has the longest latency and is issued first.
        assert_eq!(func.blocks[b].insts[0], ld);
        assert!(position(&func, b, add) < position(&func, b, st));
        assert!(position(&func, b, mv) < position(&func, b, add));
    }

    /// A straight-line block where every read sees the latest write of its register.
    fn straight_line(ops: &[(u8, u32, u32)]) -> (Function, RegAssignment) {
        let mut fb = toy::builder(None);
        let b = fb.block();
        let mut current: [Option<Inst>; 4] = [None; 4];
        for &(kind, r, src) in ops {
            let (r, src) = (r as usize, src as usize);
            match (kind, current[src]) {
                (1, Some(s)) => {
                    current[r] = Some(fb.ins(b, ADD, &[s], Some(gpr(r as u32 + 1))));
                }
                (2, Some(s)) => {
                    fb.ins(b, STORE, &[s], None);
                }
                (3, _) => {
                    let kill = fb.ins(b, POLL, &[], None);
                    fb.kills(kill, &[gpr(r as u32 + 1)]);
                    current[r] = None;
                }
                _ => {
                    current[r] = Some(fb.ins(b, LOAD, &[], Some(gpr(r as u32 + 1))));
                }
            }
        }
        fb.ins_kind(b, RET, InstKind::Return, &[], None);
        fb.finish()
    }

    proptest! {
        #[test]
        fn schedules_are_legal(ops in prop::collection::vec((0u8..4, 0u32..4, 0u32..4), 1..24)) {
            let isa = ToyIsa::cisc();
            let (mut func, regs) = straight_line(&ops);
            let b = Block::from_u32(0);
            let before = func.blocks[b].insts.len();

            // The verifier runs on every block after scheduling.
            let sched = schedule_function(&mut func, &isa, &regs, &Flags::default());
            prop_assert!(sched.is_ok(), "{:?}", sched.err());

            let insts = &func.blocks[b].insts;
            prop_assert_eq!(insts.len(), before);
            for (pos, &inst) in insts.iter().enumerate() {
                for input in &func.insts[inst].inputs {
                    prop_assert!(insts[..pos].contains(input));
                }
            }
        }
    }
}
