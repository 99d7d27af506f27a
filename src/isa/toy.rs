//! A small table-driven target.
//!
//! The toy target comes in two flavors:
//!
//! - [`ToyIsa::cisc`]: variable length instructions, a one byte nop, 2-byte short branches with
//!   an 8-bit displacement and 6-byte (conditional) or 5-byte (unconditional) long branches.
//!   Instructions using registers 8 and up take a one byte prefix.
//! - [`ToyIsa::risc`]: 4-byte instructions and branches with a delay slot. Branches encode as
//!   the branch word followed by a nop in the delay slot.
//!
//! Registers 0 to 15 are general purpose, register 16 holds the condition flags and every
//! higher number is an 8-byte stack slot.

use crate::buffer::{CodeBuffer, CodeOffset, LabelUse, MachLabel};
use crate::entity::EntityRef;
use crate::ir::{
    AvoidAdjacent, Function, FunctionBuilder, Inst, InstKind, MethodRef, Opcode, OptoReg,
    Pipeline, PipelineInfo, RegAssignment,
};
use crate::isa::{EmitInfo, TargetIsa};
use smallvec::SmallVec;

/// Opcodes of the toy target.
pub mod opcodes {
    use crate::ir::Opcode;

    /// No operation.
    pub const NOP: Opcode = Opcode(0);
    /// Register move.
    pub const MOV: Opcode = Opcode(1);
    /// Addition.
    pub const ADD: Opcode = Opcode(2);
    /// Multiplication, two cycles on the first ALU.
    pub const MUL: Opcode = Opcode(3);
    /// Memory load.
    pub const LOAD: Opcode = Opcode(4);
    /// Memory store.
    pub const STORE: Opcode = Opcode(5);
    /// Load from the constant table.
    pub const LOAD_CONST: Opcode = Opcode(6);
    /// Compare, setting the flags register.
    pub const CMP: Opcode = Opcode(7);
    /// Conditional branch, long form.
    pub const JCC: Opcode = Opcode(8);
    /// Conditional branch, short form.
    pub const JCC_SHORT: Opcode = Opcode(9);
    /// Unconditional branch, long form.
    pub const JMP: Opcode = Opcode(10);
    /// Unconditional branch, short form.
    pub const JMP_SHORT: Opcode = Opcode(11);
    /// Call.
    pub const CALL: Opcode = Opcode(12);
    /// Safepoint poll.
    pub const POLL: Opcode = Opcode(13);
    /// Return.
    pub const RET: Opcode = Opcode(14);
    /// Trap.
    pub const HALT: Opcode = Opcode(15);
    /// Implicit null check marker, no code.
    pub const NULL_CHECK: Opcode = Opcode(16);
    /// Exception dispatch marker, no code.
    pub const CATCH: Opcode = Opcode(17);
    /// Memory fence; must not be adjacent to another fence.
    pub const FENCE: Opcode = Opcode(18);
    /// Spin loop hint that must be aligned.
    pub const SPIN: Opcode = Opcode(19);

    pub(super) const COUNT: usize = 20;
}

use opcodes::*;

/// Number of machine registers.
pub const NUM_REGS: u32 = 17;

/// Size of a stack slot.
pub const SLOT_SIZE: u32 = 8;

const UNIT_ALU0: u8 = 0;
const UNIT_ALU1: u8 = 1;
const UNIT_MEM: u8 = 2;
const UNIT_BR: u8 = 3;

const RISC_NOP: u32 = 0x0100_0000;

/// General purpose register `n`.
pub fn gpr(n: u32) -> OptoReg {
    debug_assert!(n < 16);
    OptoReg::new(n as usize)
}

/// The condition flags register.
pub fn flags() -> OptoReg {
    OptoReg::new(16)
}

/// A function builder using the toy register file.
pub fn builder(method: Option<MethodRef>) -> FunctionBuilder {
    FunctionBuilder::new(method, NUM_REGS, SLOT_SIZE)
}

/// Displacement fields, each relative to the end of the field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToyLabelUse {
    /// 8-bit displacement.
    Rel8,
    /// 16-bit displacement.
    Rel16,
    /// 32-bit displacement.
    Rel32,
}

impl LabelUse for ToyLabelUse {
    fn max_pos_range(self) -> CodeOffset {
        match self {
            ToyLabelUse::Rel8 => 0x7f + 1,
            ToyLabelUse::Rel16 => 0x7fff + 2,
            ToyLabelUse::Rel32 => 0x7fff_ffff,
        }
    }

    fn max_neg_range(self) -> CodeOffset {
        match self {
            ToyLabelUse::Rel8 => 0x80 - 1,
            ToyLabelUse::Rel16 => 0x8000 - 2,
            ToyLabelUse::Rel32 => 0x8000_0000 - 4,
        }
    }

    fn patch_size(self) -> CodeOffset {
        match self {
            ToyLabelUse::Rel8 => 1,
            ToyLabelUse::Rel16 => 2,
            ToyLabelUse::Rel32 => 4,
        }
    }

    fn patch(self, buffer: &mut [u8], use_offset: CodeOffset, label_offset: CodeOffset) {
        let pc_rel =
            i64::from(label_offset) - i64::from(use_offset) - i64::from(self.patch_size());
        match self {
            ToyLabelUse::Rel8 => buffer[0] = pc_rel as i8 as u8,
            ToyLabelUse::Rel16 => buffer.copy_from_slice(&(pc_rel as i16).to_le_bytes()),
            ToyLabelUse::Rel32 => buffer.copy_from_slice(&(pc_rel as i32).to_le_bytes()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flavor {
    Cisc,
    Risc,
}

/// The toy target.
#[derive(Clone, Debug)]
pub struct ToyIsa {
    flavor: Flavor,
    info: PipelineInfo,
    pipelines: Vec<Pipeline>,
    unknown: Pipeline,
}

impl ToyIsa {
    /// The variable length flavor.
    pub fn cisc() -> Self {
        Self::new(Flavor::Cisc)
    }

    /// The fixed width flavor with branch delay slots.
    pub fn risc() -> Self {
        Self::new(Flavor::Risc)
    }

    fn new(flavor: Flavor) -> Self {
        let risc = flavor == Flavor::Risc;
        let branch = |p: Pipeline| if risc { p.with_branch_delay() } else { p };
        let mut pipelines = vec![Pipeline::new(1); COUNT];
        let mut set = |op: Opcode, p: Pipeline| pipelines[usize::from(op.0)] = p;

        set(NOP, Pipeline::new(0));
        set(MOV, Pipeline::new(1).with_resources(&[&[UNIT_ALU1]]));
        set(ADD, Pipeline::new(1).with_resources(&[&[UNIT_ALU0]]));
        set(
            MUL,
            Pipeline::new(3).with_resources(&[&[UNIT_ALU0], &[UNIT_ALU0]]),
        );
        set(LOAD, Pipeline::new(3).with_resources(&[&[UNIT_MEM]]));
        set(STORE, Pipeline::new(1).with_resources(&[&[UNIT_MEM]]));
        set(LOAD_CONST, Pipeline::new(2).with_resources(&[&[UNIT_MEM]]));
        set(CMP, Pipeline::new(1).with_resources(&[&[UNIT_ALU1]]));
        for op in [JCC, JCC_SHORT, JMP, JMP_SHORT] {
            set(op, branch(Pipeline::new(0).with_resources(&[&[UNIT_BR]])));
        }
        set(
            CALL,
            Pipeline::new(1)
                .with_resources(&[&[UNIT_BR]])
                .with_multiple_bundles(),
        );
        set(POLL, Pipeline::new(1).with_resources(&[&[UNIT_MEM]]));
        set(RET, Pipeline::new(0).with_resources(&[&[UNIT_BR]]));
        set(HALT, Pipeline::new(0).with_resources(&[&[UNIT_BR]]));
        set(NULL_CHECK, Pipeline::empty());
        set(CATCH, Pipeline::empty());
        set(
            FENCE,
            Pipeline::new(1)
                .with_resources(&[&[UNIT_MEM]])
                .with_avoid(AvoidAdjacent::BEFORE | AvoidAdjacent::AFTER),
        );
        set(SPIN, Pipeline::new(1).with_resources(&[&[UNIT_ALU0]]));

        let info = PipelineInfo {
            max_instrs_per_cycle: if risc { 2 } else { 3 },
            branch_has_delay_slot: risc,
            instr_unit_size: if risc { Some(4) } else { None },
            requires_bundling: false,
        };
        Self {
            flavor,
            info,
            pipelines,
            unknown: Pipeline::new(1),
        }
    }

    /// Does `inst` touch a register that needs the prefix byte?
    fn needs_prefix(&self, func: &Function, inst: Inst, regs: &RegAssignment) -> bool {
        let extended = |r: OptoReg| (8..16).contains(&r.index());
        regs.get(inst).regs().any(extended)
            || func.insts[inst]
                .inputs
                .iter()
                .any(|&i| regs.get(i).regs().any(extended))
    }

    fn operand_bytes(
        &self,
        func: &Function,
        inst: Inst,
        regs: &RegAssignment,
    ) -> SmallVec<[u8; 8]> {
        let mut bytes = SmallVec::new();
        bytes.extend(regs.get(inst).regs().map(|r| r.index() as u8));
        for &i in &func.insts[inst].inputs {
            bytes.extend(regs.get(i).regs().map(|r| r.index() as u8));
        }
        bytes
    }

    fn branch_field(
        buf: &mut CodeBuffer<ToyLabelUse>,
        target: Option<MachLabel>,
        kind: ToyLabelUse,
    ) {
        let at = buf.cur_offset();
        if let Some(label) = target {
            buf.use_label_at_offset(at, label, kind);
        }
        for _ in 0..kind.patch_size() {
            buf.put1(0);
        }
    }

    fn emit_cisc(
        &self,
        func: &Function,
        inst: Inst,
        regs: &RegAssignment,
        info: &EmitInfo<'_>,
        buf: &mut CodeBuffer<ToyLabelUse>,
        size: CodeOffset,
    ) {
        let data = &func.insts[inst];
        match data.opcode {
            NOP => buf.put1(0x90),
            RET => buf.put1(0xc3),
            NULL_CHECK | CATCH => {}
            JCC => {
                buf.put_data(&[0x0f, 0x80]);
                Self::branch_field(buf, info.target, ToyLabelUse::Rel32);
            }
            JCC_SHORT => {
                buf.put1(0x70);
                Self::branch_field(buf, info.target, ToyLabelUse::Rel8);
            }
            JMP => {
                buf.put1(0xe9);
                Self::branch_field(buf, info.target, ToyLabelUse::Rel32);
            }
            JMP_SHORT => {
                buf.put1(0xeb);
                Self::branch_field(buf, info.target, ToyLabelUse::Rel8);
            }
            CALL => {
                buf.put1(0xe8);
                buf.put4(0);
                self.emit_call_stub(func, inst, buf);
            }
            LOAD_CONST => {
                let dst = regs.first(inst).map_or(0, |r| r.index() as u8);
                let offset = data
                    .constant
                    .expand()
                    .map_or(0, |c| info.constants.offset(c));
                buf.put_data(&[0x10 + LOAD_CONST.0 as u8, dst]);
                buf.put4(offset);
            }
            op => {
                let mut bytes: SmallVec<[u8; 8]> = SmallVec::new();
                if self.needs_prefix(func, inst, regs) {
                    bytes.push(0x40);
                }
                bytes.push(0x10 + op.0 as u8);
                bytes.extend(self.operand_bytes(func, inst, regs));
                bytes.resize(size as usize, 0);
                buf.put_data(&bytes);
            }
        }
    }

    fn emit_risc(
        &self,
        func: &Function,
        inst: Inst,
        regs: &RegAssignment,
        info: &EmitInfo<'_>,
        buf: &mut CodeBuffer<ToyLabelUse>,
    ) {
        let data = &func.insts[inst];
        let op = data.opcode.0 as u8;
        match data.opcode {
            NOP => buf.put4(RISC_NOP),
            NULL_CHECK | CATCH => {}
            JCC | JMP => {
                buf.put_data(&[op, 0]);
                Self::branch_field(buf, info.target, ToyLabelUse::Rel16);
                buf.put4(RISC_NOP);
            }
            CALL => {
                buf.put4(u32::from(op));
                self.emit_call_stub(func, inst, buf);
            }
            LOAD_CONST => {
                let dst = regs.first(inst).map_or(0, |r| r.index() as u8);
                let offset = data
                    .constant
                    .expand()
                    .map_or(0, |c| info.constants.offset(c));
                buf.put_data(&[op, dst]);
                buf.put2(offset as u16);
            }
            _ => {
                let mut word: SmallVec<[u8; 8]> = SmallVec::new();
                word.push(op);
                word.extend(self.operand_bytes(func, inst, regs));
                word.resize(4, 0);
                buf.put_data(&word);
            }
        }
    }

    fn emit_call_stub(&self, func: &Function, inst: Inst, buf: &mut CodeBuffer<ToyLabelUse>) {
        let stub = self.call_stub_size(func, inst);
        if stub > 0 {
            let stubs = buf.stubs_mut();
            for _ in 0..stub {
                stubs.put1(0xcc);
            }
        }
    }
}

impl TargetIsa for ToyIsa {
    type LabelUse = ToyLabelUse;

    fn name(&self) -> &'static str {
        match self.flavor {
            Flavor::Cisc => "toy-cisc",
            Flavor::Risc => "toy-risc",
        }
    }

    fn pipeline_info(&self) -> &PipelineInfo {
        &self.info
    }

    fn pipeline(&self, opcode: Opcode) -> &Pipeline {
        self.pipelines
            .get(usize::from(opcode.0))
            .unwrap_or(&self.unknown)
    }

    fn nop_opcode(&self) -> Opcode {
        NOP
    }

    fn nop_size(&self) -> CodeOffset {
        match self.flavor {
            Flavor::Cisc => 1,
            Flavor::Risc => 4,
        }
    }

    fn inst_size(
        &self,
        func: &Function,
        inst: Inst,
        opcode: Opcode,
        regs: &RegAssignment,
    ) -> CodeOffset {
        match self.flavor {
            Flavor::Risc => match opcode {
                NULL_CHECK | CATCH => 0,
                JCC | JMP => 8,
                _ => 4,
            },
            Flavor::Cisc => {
                let prefix = || CodeOffset::from(self.needs_prefix(func, inst, regs));
                match opcode {
                    NOP | RET => 1,
                    NULL_CHECK | CATCH => 0,
                    MOV => 2 + prefix(),
                    ADD | LOAD | STORE | CMP => 3 + prefix(),
                    MUL => 4 + prefix(),
                    LOAD_CONST => 6,
                    JCC => 6,
                    JMP | CALL => 5,
                    JCC_SHORT | JMP_SHORT | HALT | SPIN => 2,
                    POLL | FENCE => 3,
                    _ => 4,
                }
            }
        }
    }

    fn inst_alignment(&self, opcode: Opcode) -> CodeOffset {
        match (self.flavor, opcode) {
            (Flavor::Cisc, SPIN) => 4,
            (Flavor::Risc, SPIN) => 8,
            _ => 1,
        }
    }

    fn ret_addr_offset(&self, _func: &Function, _inst: Inst) -> CodeOffset {
        match self.flavor {
            Flavor::Cisc => 5,
            Flavor::Risc => 4,
        }
    }

    fn call_stub_size(&self, func: &Function, inst: Inst) -> CodeOffset {
        match &func.insts[inst].kind {
            InstKind::Call(c) if !c.leaf => 8,
            _ => 0,
        }
    }

    fn short_branch_version(&self, opcode: Opcode) -> Option<Opcode> {
        match (self.flavor, opcode) {
            (Flavor::Cisc, JCC) => Some(JCC_SHORT),
            (Flavor::Cisc, JMP) => Some(JMP_SHORT),
            _ => None,
        }
    }

    fn is_short_branch_offset(&self, _short: Opcode, br_size: CodeOffset, offset: i64) -> bool {
        let disp = offset - i64::from(br_size);
        (-128..=127).contains(&disp)
    }

    fn emit(
        &self,
        func: &Function,
        inst: Inst,
        regs: &RegAssignment,
        info: &EmitInfo<'_>,
        buf: &mut CodeBuffer<ToyLabelUse>,
    ) {
        let size = self.inst_size(func, inst, func.insts[inst].opcode, regs);
        let start = buf.cur_offset();
        match self.flavor {
            Flavor::Cisc => self.emit_cisc(func, inst, regs, info, buf, size),
            Flavor::Risc => self.emit_risc(func, inst, regs, info, buf),
        }
        debug_assert!(buf.is_exhausted() || buf.cur_offset() - start == size);
    }

    fn emit_nops(&self, count: u32, buf: &mut CodeBuffer<ToyLabelUse>) {
        for _ in 0..count {
            match self.flavor {
                Flavor::Cisc => buf.put1(0x90),
                Flavor::Risc => buf.put4(RISC_NOP),
            }
        }
    }

    fn exception_handler_size(&self) -> CodeOffset {
        match self.flavor {
            Flavor::Cisc => 5,
            Flavor::Risc => 8,
        }
    }

    fn deopt_handler_size(&self) -> CodeOffset {
        match self.flavor {
            Flavor::Cisc => 10,
            Flavor::Risc => 12,
        }
    }

    fn emit_exception_handler(&self, buf: &mut CodeBuffer<ToyLabelUse>) -> CodeOffset {
        let stubs = buf.stubs_mut();
        let offset = stubs.cur_offset();
        match self.flavor {
            Flavor::Cisc => stubs.put_data(&[0xe9, 0, 0, 0, 0]),
            Flavor::Risc => {
                stubs.put4(u32::from(JMP.0));
                stubs.put4(RISC_NOP);
            }
        }
        offset
    }

    fn emit_deopt_handler(&self, buf: &mut CodeBuffer<ToyLabelUse>) -> CodeOffset {
        let stubs = buf.stubs_mut();
        let offset = stubs.cur_offset();
        match self.flavor {
            Flavor::Cisc => stubs.put_data(&[0xe8, 0, 0, 0, 0, 0xe9, 0, 0, 0, 0]),
            Flavor::Risc => {
                stubs.put4(u32::from(CALL.0));
                stubs.put4(u32::from(JMP.0));
                stubs.put4(RISC_NOP);
            }
        }
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SectionSizes;
    use crate::emit::ConstantLayout;

    #[test]
    fn label_patches() {
        let mut b = [0u8; 4];
        ToyLabelUse::Rel8.patch(&mut b[..1], 10, 20);
        assert_eq!(b[0], 9);
        ToyLabelUse::Rel8.patch(&mut b[..1], 10, 0);
        assert_eq!(b[0] as i8, -11);
        ToyLabelUse::Rel32.patch(&mut b, 2, 0x106);
        assert_eq!(u32::from_le_bytes(b), 0x100);
        let mut h = [0u8; 2];
        ToyLabelUse::Rel16.patch(&mut h, 4, 0);
        assert_eq!(i16::from_le_bytes(h), -6);
    }

    #[test]
    fn short_branch_range() {
        let isa = ToyIsa::cisc();
        assert!(isa.is_short_branch_offset(JCC_SHORT, 6, 133));
        assert!(!isa.is_short_branch_offset(JCC_SHORT, 6, 134));
        assert!(isa.is_short_branch_offset(JCC_SHORT, 6, -122));
        assert!(!isa.is_short_branch_offset(JCC_SHORT, 6, -123));
        assert_eq!(isa.short_branch_version(JCC), Some(JCC_SHORT));
        assert_eq!(ToyIsa::risc().short_branch_version(JCC), None);
    }

    #[test]
    fn sizes_follow_registers() {
        let isa = ToyIsa::cisc();
        let mut fb = builder(None);
        let b = fb.block();
        let lo = fb.ins(b, MOV, &[], Some(gpr(1)));
        let hi = fb.ins(b, MOV, &[lo], Some(gpr(9)));
        let (func, regs) = fb.finish();
        assert_eq!(isa.inst_size(&func, lo, MOV, &regs), 2);
        assert_eq!(isa.inst_size(&func, hi, MOV, &regs), 3);
        assert_eq!(isa.inst_size(&func, hi, JCC, &regs), 6);

        let risc = ToyIsa::risc();
        assert_eq!(risc.inst_size(&func, hi, MOV, &regs), 4);
        assert_eq!(risc.inst_size(&func, hi, JCC, &regs), 8);
    }

    #[test]
    fn emitted_size_matches() {
        let isa = ToyIsa::cisc();
        let mut fb = builder(None);
        let b = fb.block();
        let x = fb.ins(b, LOAD, &[], Some(gpr(10)));
        let y = fb.ins(b, ADD, &[x, x], Some(gpr(2)));
        let (func, regs) = fb.finish();
        let consts = ConstantLayout::default();
        let info = EmitInfo {
            target: None,
            constants: &consts,
        };
        let mut buf = CodeBuffer::new(SectionSizes {
            consts: 0,
            insts: 64,
            stubs: 0,
        });
        isa.emit(&func, x, &regs, &info, &mut buf);
        isa.emit(&func, y, &regs, &info, &mut buf);
        assert_eq!(buf.cur_offset(), 4 + 4);
        assert_eq!(buf.insts().data()[..2], [0x40, 0x10 + LOAD.0 as u8]);
    }
}
