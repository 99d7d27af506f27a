//! Register anti-dependences.
//!
//! After register allocation, two instructions writing the same register may not be
//! reordered, and no reader of a register value may move past the next write of that
//! register. The builder scans a window bottom-up and keeps one anchor per register: the
//! closest later instruction writing it, or a [`PinchPoint`].
//!
//! When a register is killed several times and read in between, every reader would need an
//! edge to every later kill. Instead, readers are ordered before a pinch point and the kills
//! after it. A pinch point that never gets a reader is dropped again.

use crate::entity::SecondaryMap;
use crate::ir::{Function, Inst, InstFlags, OptoReg, RegAssignment};
use crate::result::{OutputError, OutputResult};
use crate::sched::{DepGraph, Node, PinchPoint};
use smallvec::SmallVec;

/// A source of pinch points, shared by all blocks of one compile.
///
/// Pinch points are recycled through a free list. The number of distinct pinch points ever
/// created is bounded.
#[derive(Clone, Debug)]
pub struct PinchPool {
    free: Vec<PinchPoint>,
    created: u32,
    limit: u32,
}

impl PinchPool {
    /// A pool creating at most `limit` pinch points.
    pub fn new(limit: u32) -> Self {
        Self {
            free: Vec::new(),
            created: 0,
            limit,
        }
    }

    /// Take a pinch point from the free list or create one.
    pub fn alloc(&mut self) -> Option<PinchPoint> {
        if let Some(p) = self.free.pop() {
            return Some(p);
        }
        if self.created >= self.limit {
            return None;
        }
        let p = PinchPoint::from_u32(self.created);
        self.created += 1;
        Some(p)
    }

    /// Return `p` to the free list.
    pub fn free(&mut self, p: PinchPoint) {
        debug_assert!(!self.free.contains(&p), "{p} freed twice");
        self.free.push(p);
    }

    /// Number of distinct pinch points created so far.
    pub fn created(&self) -> u32 {
        self.created
    }

    /// Number of pinch points on the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// The closest later writer of a register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Anchor {
    /// An instruction whose result is read.
    Def(Inst),
    /// An instruction clobbering the register without anyone reading the result.
    Kill(Inst),
    /// A pinch point between the readers and the later kills.
    Pinch(PinchPoint),
}

#[derive(Clone, Debug, Default)]
struct PinchState {
    /// A def that must follow every kill ordered after this pinch point.
    later_def: Option<Inst>,
    /// Instructions ordered after the pinch point.
    dependents: SmallVec<[Inst; 4]>,
    /// Number of readers ordered before it.
    uses: u32,
}

struct AntiDepBuilder<'a> {
    func: &'a Function,
    regs: &'a RegAssignment,
    anchors: SecondaryMap<OptoReg, Option<Anchor>>,
    pinches: SecondaryMap<PinchPoint, PinchState>,
    live: Vec<PinchPoint>,
}

impl AntiDepBuilder<'_> {
    fn reads_reg(&self, inst: Inst, reg: OptoReg) -> bool {
        self.func.insts[inst]
            .inputs
            .iter()
            .any(|&i| self.regs.get(i).regs().any(|r| r == reg))
    }

    fn do_def(
        &mut self,
        graph: &mut DepGraph,
        pool: &mut PinchPool,
        kill: Inst,
        reg: OptoReg,
        is_def: bool,
    ) -> OutputResult<()> {
        let pinch = match self.anchors[reg] {
            None => {
                self.anchors[reg] = Some(if is_def {
                    Anchor::Def(kill)
                } else {
                    Anchor::Kill(kill)
                });
                return Ok(());
            }
            Some(_) if is_def => {
                self.anchors[reg] = Some(Anchor::Def(kill));
                return Ok(());
            }
            Some(Anchor::Pinch(p)) => p,
            Some(later @ (Anchor::Def(_) | Anchor::Kill(_))) => {
                let p = pool.alloc().ok_or(OutputError::TooManyPinchPoints {
                    block: graph.block(),
                })?;
                trace!("{p} pinches {reg} above {later:?}");
                self.live.push(p);
                self.pinches[p] = PinchState::default();
                match later {
                    Anchor::Def(d) => self.pinches[p].later_def = Some(d),
                    Anchor::Kill(k) => {
                        graph.add_edge(Node::Pinch(p), Node::Inst(k));
                        self.pinches[p].dependents.push(k);
                    }
                    Anchor::Pinch(_) => {}
                }
                self.anchors[reg] = Some(Anchor::Pinch(p));
                p
            }
        };

        if let Some(later_def) = self.pinches[pinch].later_def {
            graph.add_edge(Node::Inst(kill), Node::Inst(later_def));
        }

        // A kill that also reads the register is a pinch point of its own.
        if self.pinches[pinch].uses == 0 && self.reads_reg(kill, reg) {
            let state = core::mem::take(&mut self.pinches[pinch]);
            for d in state.dependents {
                graph.remove_edge(Node::Pinch(pinch), Node::Inst(d));
                graph.add_edge(Node::Inst(kill), Node::Inst(d));
            }
            self.live.retain(|&p| p != pinch);
            pool.free(pinch);
            self.anchors[reg] = Some(Anchor::Def(kill));
            return Ok(());
        }

        if graph.add_edge(Node::Pinch(pinch), Node::Inst(kill)) {
            self.pinches[pinch].dependents.push(kill);
        }
        Ok(())
    }

    fn do_use(&mut self, graph: &mut DepGraph, user: Inst, reg: OptoReg) {
        match self.anchors[reg] {
            None => {}
            Some(Anchor::Def(d) | Anchor::Kill(d)) => {
                graph.add_edge(Node::Inst(user), Node::Inst(d));
            }
            Some(Anchor::Pinch(p)) => {
                if !graph.contains(Node::Pinch(p)) {
                    graph.insert_after(Node::Pinch(p), Node::Inst(user));
                    self.pinches[p].later_def = None;
                }
                if graph.add_edge(Node::Inst(user), Node::Pinch(p)) {
                    self.pinches[p].uses += 1;
                }
            }
        }
    }
}

/// Add the register anti-dependences of the window in `graph`.
///
/// `consumers` counts the readers of every instruction's result; a write nobody reads is
/// treated as a kill. Returns the pinch points left in the window. They go back to `pool`
/// once the block is scheduled.
pub fn add_anti_dependences(
    func: &Function,
    regs: &RegAssignment,
    consumers: &SecondaryMap<Inst, u32>,
    pool: &mut PinchPool,
    graph: &mut DepGraph,
) -> OutputResult<Vec<PinchPoint>> {
    let window: Vec<Inst> = graph.nodes().iter().filter_map(|n| n.inst()).collect();
    let mut b = AntiDepBuilder {
        func,
        regs,
        anchors: SecondaryMap::new(),
        pinches: SecondaryMap::new(),
        live: Vec::new(),
    };
    let derived = |i: Inst| func.insts[i].flags.contains(InstFlags::DERIVED_PTR);
    let mut last_safepoint: Option<(usize, Inst)> = None;

    for (idx, &inst) in window.iter().enumerate().rev() {
        let data = &func.insts[inst];

        if let Some((_, sp)) = last_safepoint {
            if data.inputs.iter().any(|&i| derived(i)) {
                graph.add_edge(Node::Inst(inst), Node::Inst(sp));
            }
        }

        let is_def = consumers[inst] > 0;
        for reg in regs.get(inst).regs() {
            b.do_def(graph, pool, inst, reg, is_def)?;
        }
        if let Some(kills) = data.kill_mask() {
            for reg in kills.iter() {
                b.do_def(graph, pool, inst, reg, false)?;
            }
        }
        for &input in &data.inputs {
            for reg in regs.get(input).regs() {
                b.do_use(graph, inst, reg);
            }
        }

        if data.is_safepoint() {
            let end = last_safepoint.map_or(window.len(), |(pos, _)| pos);
            for &m in &window[idx + 1..end] {
                if derived(m) {
                    graph.add_edge(Node::Inst(inst), Node::Inst(m));
                }
            }
            last_safepoint = Some((idx, inst));
        }
    }

    let mut kept = Vec::new();
    for p in b.live {
        if graph.contains(Node::Pinch(p)) {
            kept.push(p);
        } else {
            for &d in &b.pinches[p].dependents {
                graph.remove_edge(Node::Pinch(p), Node::Inst(d));
            }
            pool.free(p);
        }
    }
    trace!("{} keeps pinch points {kept:?}", graph.block());
    Ok(kept)
}
