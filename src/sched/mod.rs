//! Local instruction scheduling.
//!
//! Each block is scheduled on its own, bottom-up. The scheduler works on a dependence graph
//! over the block's schedulable window ([`DepGraph`]). Value operands and ordering-only inputs
//! of the instructions are the initial edges. The anti-dependence builder in [`antidep`] then
//! adds the register ordering edges, using synthetic [`PinchPoint`] nodes to keep the edge
//! count down. Finally [`list`] picks instructions cycle by cycle until the window is empty.
//!
//! The scheduler only reorders instructions inside a block. It never adds code, except for
//! the delay slot bookkeeping recorded in the per-instruction [`Bundle`] records.

use crate::entity::{SecondaryMap, entity_impl};
use crate::ir::{Block, Function, Inst, RegAssignment};
use crate::isa::TargetIsa;
use crate::result::OutputResult;
use crate::settings::Flags;
use crate::timing;
use core::fmt;
use core::ops::{Index, IndexMut};
use log::debug;
use smallvec::SmallVec;

pub mod antidep;
pub mod bundle;
pub mod list;
pub mod verify;

pub use self::bundle::{Bundle, BundleUse};

/// A synthetic scheduling node standing for "the register is free again".
///
/// Uses of a register are ordered before the pinch point and later kills of the register
/// after it, replacing a quadratic number of direct edges.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinchPoint(u32);
entity_impl!(PinchPoint, "pinch");

/// A node of the scheduling graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    /// A real instruction.
    Inst(Inst),
    /// A pinch point. Never emitted.
    Pinch(PinchPoint),
}

impl Node {
    /// The instruction, if this is not a pinch point.
    pub fn inst(self) -> Option<Inst> {
        match self {
            Node::Inst(i) => Some(i),
            Node::Pinch(_) => None,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Node::Inst(i) => write!(f, "{i}"),
            Node::Pinch(p) => write!(f, "{p}"),
        }
    }
}

impl From<Inst> for Node {
    fn from(inst: Inst) -> Self {
        Node::Inst(inst)
    }
}

impl From<PinchPoint> for Node {
    fn from(p: PinchPoint) -> Self {
        Node::Pinch(p)
    }
}

/// A map from scheduling nodes to values.
#[derive(Clone, Debug)]
pub struct NodeMap<T: Clone + Default> {
    insts: SecondaryMap<Inst, T>,
    pinches: SecondaryMap<PinchPoint, T>,
}

impl<T: Clone + Default> NodeMap<T> {
    /// A map with every node set to the default value.
    pub fn new() -> Self {
        Self {
            insts: SecondaryMap::new(),
            pinches: SecondaryMap::new(),
        }
    }
}

impl<T: Clone + Default> Default for NodeMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Default> Index<Node> for NodeMap<T> {
    type Output = T;

    fn index(&self, n: Node) -> &T {
        match n {
            Node::Inst(i) => &self.insts[i],
            Node::Pinch(p) => &self.pinches[p],
        }
    }
}

impl<T: Clone + Default> IndexMut<Node> for NodeMap<T> {
    fn index_mut(&mut self, n: Node) -> &mut T {
        match n {
            Node::Inst(i) => &mut self.insts[i],
            Node::Pinch(p) => &mut self.pinches[p],
        }
    }
}

/// How a node depends on one of its predecessors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepKind {
    /// The node reads the predecessor's result as value operand `n`.
    Operand(usize),
    /// The predecessor only has to come first.
    Order,
}

/// An edge to a node that must be scheduled earlier in the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dep {
    /// The predecessor.
    pub node: Node,
    /// The kind of edge.
    pub kind: DepKind,
}

/// The dependence graph of one block's schedulable window.
#[derive(Clone, Debug)]
pub struct DepGraph {
    block: Block,
    nodes: Vec<Node>,
    preds: NodeMap<SmallVec<[Dep; 4]>>,
    in_window: NodeMap<bool>,
}

impl DepGraph {
    /// The graph of `insts`, a window of `block`, with its value and ordering inputs.
    pub fn new(func: &Function, block: Block, insts: &[Inst]) -> Self {
        let mut g = Self {
            block,
            nodes: insts.iter().map(|&i| Node::Inst(i)).collect(),
            preds: NodeMap::new(),
            in_window: NodeMap::new(),
        };
        for &inst in insts {
            g.in_window[Node::Inst(inst)] = true;
            let data = &func.insts[inst];
            let preds = &mut g.preds[Node::Inst(inst)];
            for (k, &input) in data.inputs.iter().enumerate() {
                preds.push(Dep {
                    node: Node::Inst(input),
                    kind: DepKind::Operand(k),
                });
            }
            for &before in &data.prec {
                preds.push(Dep {
                    node: Node::Inst(before),
                    kind: DepKind::Order,
                });
            }
        }
        g
    }

    /// The block of the window.
    pub fn block(&self) -> Block {
        self.block
    }

    /// The nodes of the window, in block order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Is `n` part of the window?
    pub fn contains(&self, n: Node) -> bool {
        self.in_window[n]
    }

    /// Nodes `n` depends on.
    pub fn preds(&self, n: Node) -> &[Dep] {
        &self.preds[n]
    }

    /// Is there an edge making `before` precede `after`?
    pub fn has_edge(&self, before: Node, after: Node) -> bool {
        self.preds[after].iter().any(|d| d.node == before)
    }

    /// Require `before` to precede `after`. Returns false if the edge was redundant.
    pub fn add_edge(&mut self, before: Node, after: Node) -> bool {
        if before == after || self.has_edge(before, after) {
            return false;
        }
        trace!("edge {before:?} -> {after:?}");
        self.preds[after].push(Dep {
            node: before,
            kind: DepKind::Order,
        });
        true
    }

    /// Remove every edge making `before` precede `after`.
    pub fn remove_edge(&mut self, before: Node, after: Node) {
        self.preds[after].retain(|d| d.node != before);
    }

    /// Position of `n` in the window.
    pub fn position(&self, n: Node) -> Option<usize> {
        self.nodes.iter().position(|&m| m == n)
    }

    /// Insert `n` into the window right after `anchor`.
    pub fn insert_after(&mut self, n: Node, anchor: Node) {
        let pos = self.position(anchor).map_or(self.nodes.len(), |p| p + 1);
        self.nodes.insert(pos, n);
        self.in_window[n] = true;
    }

    /// Remove `n` from the window, dropping its incoming edges.
    pub fn remove(&mut self, n: Node) {
        self.nodes.retain(|&m| m != n);
        self.in_window[n] = false;
        self.preds[n].clear();
    }
}

/// Counters collected while scheduling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    /// Blocks with a non-empty window.
    pub blocks: u32,
    /// Instructions scheduled.
    pub instructions: u32,
    /// Bundles closed with at least one instruction.
    pub bundles: u32,
    /// Branches with a delay slot.
    pub branches: u32,
    /// Delay slots filled with a useful instruction.
    pub delay_slots_filled: u32,
    /// Pinch points wired into a block.
    pub pinch_points: u32,
}

/// The result of scheduling a function.
#[derive(Clone, Debug, Default)]
pub struct Schedule {
    /// Bundling record of every instruction.
    pub bundles: SecondaryMap<Inst, Bundle>,
    /// Counters.
    pub stats: ScheduleStats,
}

/// Reorder the instructions of every block of `func` for the pipeline of `isa`.
pub fn schedule_function<I: TargetIsa>(
    func: &mut Function,
    isa: &I,
    regs: &RegAssignment,
    flags: &Flags,
) -> OutputResult<Schedule> {
    let _tt = timing::schedule();
    let mut scheduler = list::ListScheduler::new(isa, regs, flags, func.consumer_counts());

    for i in (0..func.num_blocks()).rev() {
        let block = Block::from_u32(i as u32);
        if func.blocks[block].connector {
            continue;
        }
        if flags.enable_verifier() {
            let _tt = timing::verify_schedule();
            verify::verify_schedule(func, regs, block)?;
        }
        if let Some((window, order)) = scheduler.schedule_block(func, block)? {
            func.blocks[block].insts.splice(window, order);
            if flags.enable_verifier() {
                let _tt = timing::verify_schedule();
                verify::verify_schedule(func, regs, block)?;
            }
        }
    }

    let schedule = scheduler.finish();
    debug!(
        "scheduled {} instructions of {} blocks into {} bundles, {}/{} delay slots filled",
        schedule.stats.instructions,
        schedule.stats.blocks,
        schedule.stats.bundles,
        schedule.stats.delay_slots_filled,
        schedule.stats.branches
    );
    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::InstKind;
    use crate::isa::toy::{self, ToyIsa, gpr, opcodes::*};

    #[test]
    fn graph_edges() {
        let mut fb = toy::builder(None);
        let b = fb.block();
        let x = fb.ins(b, LOAD, &[], Some(gpr(1)));
        let y = fb.ins(b, ADD, &[x, x], Some(gpr(2)));
        let (func, _) = fb.finish();
        let mut g = DepGraph::new(&func, b, &[x, y]);
        assert_eq!(g.preds(y.into()).len(), 2);
        assert!(g.has_edge(x.into(), y.into()));
        assert!(!g.add_edge(y.into(), y.into()));

        let p = PinchPoint::from_u32(0);
        g.insert_after(p.into(), x.into());
        assert_eq!(g.nodes(), &[Node::Inst(x), Node::Pinch(p), Node::Inst(y)]);
        assert!(g.add_edge(x.into(), p.into()));
        assert!(!g.add_edge(x.into(), p.into()));
        g.remove(p.into());
        assert!(!g.contains(p.into()));
        assert_eq!(g.nodes().len(), 2);
    }

    #[test]
    fn scheduling_keeps_every_instruction() {
        let _ = env_logger::try_init();
        let isa = ToyIsa::cisc();
        let mut fb = toy::builder(Some(crate::ir::MethodRef::from_u32(0)));
        let b0 = fb.block();
        let b1 = fb.block();
        let a = fb.ins(b0, LOAD, &[], Some(gpr(1)));
        let c = fb.ins(b0, LOAD, &[], Some(gpr(2)));
        let s = fb.ins(b0, ADD, &[a, c], Some(gpr(3)));
        fb.ins(b0, STORE, &[s], None);
        fb.succs(b0, &[b1]);
        fb.ins_kind(b1, RET, InstKind::Return, &[], None);
        let (mut func, regs) = fb.finish();
        let mut before = func.blocks[b0].insts.clone();

        let sched = schedule_function(&mut func, &isa, &regs, &Flags::default()).unwrap();
        let mut after = func.blocks[b0].insts.clone();
        before.sort();
        after.sort();
        assert_eq!(before, after);
        assert_eq!(sched.stats.instructions, 5);
        assert!(sched.bundles[func.blocks[b0].insts[0]].starts_bundle);
    }
}
