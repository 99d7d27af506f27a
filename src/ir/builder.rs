//! A convenience builder for register-allocated functions.

use crate::ir::{
    Block, Function, Inst, InstData, InstFlags, InstKind, MethodRef, Opcode, OptoReg, RegAssignment,
    RegMask, RegPair,
};

/// Builds a [`Function`] together with its [`RegAssignment`].
///
/// Mostly useful for tests and for front ends that produce machine instructions directly.
pub struct FunctionBuilder {
    func: Function,
    regs: RegAssignment,
}

impl FunctionBuilder {
    /// Start a function for `method` on a target with `num_regs` machine registers and stack
    /// slots of `slot_size` bytes.
    pub fn new(method: Option<MethodRef>, num_regs: u32, slot_size: u32) -> Self {
        Self {
            func: Function::new(method),
            regs: RegAssignment::new(num_regs, slot_size),
        }
    }

    /// The function built so far.
    pub fn func(&self) -> &Function {
        &self.func
    }

    /// Mutable access to the function built so far.
    pub fn func_mut(&mut self) -> &mut Function {
        &mut self.func
    }

    /// The register assignment built so far.
    pub fn regs(&self) -> &RegAssignment {
        &self.regs
    }

    /// Append a block.
    pub fn block(&mut self) -> Block {
        self.func.create_block()
    }

    /// Set the successors of `block`.
    pub fn succs(&mut self, block: Block, succs: &[Block]) -> &mut Self {
        self.func.blocks[block].succs = succs.iter().copied().collect();
        self
    }

    /// Turn `block` into a connector forwarding to `target`.
    pub fn connector(&mut self, block: Block, target: Block) -> &mut Self {
        let data = &mut self.func.blocks[block];
        data.connector = true;
        data.succs.clear();
        data.succs.push(target);
        self
    }

    /// Require `block` to start at an `align` byte boundary.
    pub fn align(&mut self, block: Block, align: u32) -> &mut Self {
        self.func.blocks[block].alignment = align;
        self
    }

    /// Append an ordinary instruction defining `def`.
    pub fn ins(
        &mut self,
        block: Block,
        opcode: Opcode,
        inputs: &[Inst],
        def: Option<OptoReg>,
    ) -> Inst {
        self.ins_kind(block, opcode, InstKind::Plain, inputs, def)
    }

    /// Append an instruction of any kind.
    pub fn ins_kind(
        &mut self,
        block: Block,
        opcode: Opcode,
        kind: InstKind,
        inputs: &[Inst],
        def: Option<OptoReg>,
    ) -> Inst {
        let inst = self
            .func
            .append_inst(block, InstData::new(opcode, kind, inputs));
        if let Some(r) = def {
            self.regs.assign(inst, RegPair::single(r));
        }
        inst
    }

    /// Give `inst` a two-register result.
    pub fn def_pair(&mut self, inst: Inst, first: OptoReg, second: OptoReg) -> &mut Self {
        self.regs.assign(inst, RegPair::pair(first, second));
        self
    }

    /// Add properties to `inst`.
    pub fn flags(&mut self, inst: Inst, flags: InstFlags) -> &mut Self {
        self.func.insts[inst].flags |= flags;
        self
    }

    /// Make `inst` clobber `regs`.
    pub fn kills(&mut self, inst: Inst, regs: &[OptoReg]) -> &mut Self {
        self.func.insts[inst].kills = Some(Box::new(RegMask::from_regs(regs)));
        self
    }

    /// Order `before` ahead of `inst` without a value dependence.
    pub fn prec(&mut self, inst: Inst, before: Inst) -> &mut Self {
        self.func.insts[inst].prec.push(before);
        self
    }

    /// Finish building.
    pub fn finish(self) -> (Function, RegAssignment) {
        (self.func, self.regs)
    }
}
