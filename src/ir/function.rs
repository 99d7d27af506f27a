//! The function being emitted.

use crate::entity::packed_option::PackedOption;
use crate::entity::{EntityRef, PrimaryMap, SecondaryMap};
use crate::ir::{Block, Constant, Inst, InstData, InstKind, MethodRef, ScopeData, ScopeRef};
use smallvec::SmallVec;

/// A basic block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockData {
    /// Instructions in their current order.
    pub insts: Vec<Inst>,
    /// Successor blocks. The taken target of a branch is always successor #0.
    pub succs: SmallVec<[Block; 2]>,
    /// The block holds no code and only forwards to successor #0.
    pub connector: bool,
    /// Alignment in bytes required at the start of the block. Loop headers have an alignment
    /// larger than one address unit; zero means no requirement.
    pub alignment: u32,
}

/// A constant table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstantData {
    /// The bytes of the constant.
    pub bytes: Vec<u8>,
    /// Required alignment, a power of two.
    pub align: u32,
}

/// A function with register-allocated machine instructions, ready to be emitted.
#[derive(Clone, Debug, Default)]
pub struct Function {
    /// Instruction definitions.
    pub insts: PrimaryMap<Inst, InstData>,
    /// Blocks in emission order.
    pub blocks: PrimaryMap<Block, BlockData>,
    /// Interpreter scopes referenced by safepoints and instructions.
    pub scopes: PrimaryMap<ScopeRef, ScopeData>,
    /// Constant table.
    pub constants: PrimaryMap<Constant, ConstantData>,
    /// The method being compiled; `None` for runtime stubs, which get no exception or deopt
    /// handlers and are never scheduled.
    pub method: Option<MethodRef>,
    inst_blocks: SecondaryMap<Inst, PackedOption<Block>>,
}

impl Function {
    /// An empty function for `method`.
    pub fn new(method: Option<MethodRef>) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    /// Append a new empty block.
    pub fn create_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    /// Append `data` at the end of `block`.
    pub fn append_inst(&mut self, block: Block, data: InstData) -> Inst {
        let inst = self.insts.push(data);
        self.blocks[block].insts.push(inst);
        self.inst_blocks[inst] = block.into();
        inst
    }

    /// Add a scope and return its reference.
    pub fn add_scope(&mut self, scope: ScopeData) -> ScopeRef {
        self.scopes.push(scope)
    }

    /// Add a constant table entry.
    pub fn add_constant(&mut self, bytes: &[u8], align: u32) -> Constant {
        self.constants.push(ConstantData {
            bytes: bytes.to_vec(),
            align,
        })
    }

    /// The block holding `inst`.
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.inst_blocks[inst].expand()
    }

    /// Number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// The last instruction of `block`.
    pub fn last_inst(&self, block: Block) -> Option<Inst> {
        self.blocks[block].insts.last().copied()
    }

    /// Skip connector blocks starting at `block`.
    pub fn non_connector(&self, block: Block) -> Block {
        let mut b = block;
        // A cycle of connectors would be malformed; stop after visiting every block once.
        for _ in 0..self.blocks.len() {
            let data = &self.blocks[b];
            match data.succs.first() {
                Some(&next) if data.connector => b = next,
                _ => break,
            }
        }
        b
    }

    /// The `i`th successor of `block`, skipping connectors.
    pub fn non_connector_successor(&self, block: Block, i: usize) -> Option<Block> {
        self.blocks[block]
            .succs
            .get(i)
            .map(|&s| self.non_connector(s))
    }

    /// Is `succ` a direct successor of `block`?
    pub fn has_successor(&self, block: Block, succ: Block) -> bool {
        self.blocks[block].succs.contains(&succ)
    }

    /// The block emitted right after `block`.
    pub fn next_block(&self, block: Block) -> Option<Block> {
        let next = Block::new(block.index() + 1);
        (next.index() < self.blocks.len()).then_some(next)
    }

    /// Number of instructions reading each instruction's result, counting value operands only.
    pub fn consumer_counts(&self) -> SecondaryMap<Inst, u32> {
        let mut counts = SecondaryMap::new();
        for data in self.insts.values() {
            for &input in &data.inputs {
                counts[input] += 1;
            }
        }
        counts
    }

    /// Does any call go through a method handle?
    pub fn has_method_handle_invokes(&self) -> bool {
        self.insts
            .values()
            .any(|d| matches!(&d.kind, InstKind::Call(c) if c.method_handle_invoke))
    }

    /// Number of levels in the scope chain ending at `scope`.
    pub fn scope_depth(&self, scope: ScopeRef) -> usize {
        let mut depth = 1;
        let mut s = scope;
        while let Some(caller) = self.scopes[s].caller.expand() {
            depth += 1;
            s = caller;
        }
        depth
    }

    /// The scope at `depth` of the chain ending at `scope`, where depth 1 is the outermost
    /// method.
    pub fn scope_at_depth(&self, scope: ScopeRef, depth: usize) -> ScopeRef {
        let total = self.scope_depth(scope);
        debug_assert!(depth >= 1 && depth <= total);
        let mut s = scope;
        for _ in depth..total {
            if let Some(caller) = self.scopes[s].caller.expand() {
                s = caller;
            }
        }
        s
    }

    /// Do two scope chains describe the same call sites?
    ///
    /// Levels without a method match regardless of their bytecode index.
    pub fn same_calls_as(&self, a: ScopeRef, b: ScopeRef) -> bool {
        if a == b {
            return true;
        }
        if self.scope_depth(a) != self.scope_depth(b) {
            return false;
        }
        let (mut p, mut q) = (a, b);
        loop {
            let (sp, sq) = (&self.scopes[p], &self.scopes[q]);
            if sp.method != sq.method {
                return false;
            }
            if sp.method.is_none() {
                return true;
            }
            if sp.bci != sq.bci || sp.reexecute != sq.reexecute {
                return false;
            }
            match (sp.caller.expand(), sq.caller.expand()) {
                (Some(pc), Some(qc)) if pc == qc => return true,
                (Some(pc), Some(qc)) => (p, q) = (pc, qc),
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}
