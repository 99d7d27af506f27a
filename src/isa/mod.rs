//! Target instruction set descriptions.
//!
//! The output pipeline knows nothing about any particular machine. Everything target
//! specific goes through [`TargetIsa`]:
//!
//! - pipeline descriptions used by the list scheduler;
//! - instruction sizes, alignment and the short branch forms used by branch shortening;
//! - instruction and stub encoders used by the emitter.
//!
//! The [`toy`] module contains a small table-driven target used by the tests.

use crate::buffer::{CodeBuffer, CodeOffset, LabelUse, MachLabel};
use crate::emit::ConstantLayout;
use crate::ir::{Function, Inst, Opcode, Pipeline, PipelineInfo, RegAssignment};

pub mod toy;

/// Information the emitter hands to the instruction encoder.
#[derive(Clone, Copy, Debug)]
pub struct EmitInfo<'a> {
    /// Label of the branch target, for branches.
    pub target: Option<MachLabel>,
    /// Offsets of the constant table entries.
    pub constants: &'a ConstantLayout,
}

/// Methods that are specialized to a target ISA.
pub trait TargetIsa {
    /// Label reference kinds used by the target's branches.
    type LabelUse: LabelUse;

    /// Name of the target.
    fn name(&self) -> &'static str;

    /// Properties of the target's pipeline as a whole.
    fn pipeline_info(&self) -> &PipelineInfo;

    /// Pipeline description of `opcode`.
    fn pipeline(&self, opcode: Opcode) -> &Pipeline;

    /// Smallest addressable code unit in bytes.
    fn addr_unit(&self) -> CodeOffset {
        1
    }

    /// The opcode of a single nop.
    fn nop_opcode(&self) -> Opcode;

    /// Size in bytes of a single nop.
    fn nop_size(&self) -> CodeOffset;

    /// Size in bytes of `inst` when encoded with `opcode`, which is either its current opcode
    /// or a candidate replacement.
    fn inst_size(
        &self,
        func: &Function,
        inst: Inst,
        opcode: Opcode,
        regs: &RegAssignment,
    ) -> CodeOffset;

    /// Required alignment in bytes of instructions with `opcode`.
    fn inst_alignment(&self, opcode: Opcode) -> CodeOffset {
        let _ = opcode;
        1
    }

    /// Padding needed before an instruction with `opcode` emitted at `offset`.
    fn compute_padding(&self, opcode: Opcode, offset: CodeOffset) -> CodeOffset {
        let align = self.inst_alignment(opcode);
        if align <= 1 {
            0
        } else {
            (align - offset % align) % align
        }
    }

    /// Offset of the return address from the start of the call `inst`.
    fn ret_addr_offset(&self, func: &Function, inst: Inst) -> CodeOffset;

    /// Size of the out-of-line stub the call `inst` emits into the stub section.
    fn call_stub_size(&self, func: &Function, inst: Inst) -> CodeOffset {
        let _ = (func, inst);
        0
    }

    /// The short form of a branch opcode, if it has one.
    fn short_branch_version(&self, opcode: Opcode) -> Option<Opcode>;

    /// Can the short branch `short` reach a target `offset` bytes from the start of a branch
    /// currently `br_size` bytes long?
    fn is_short_branch_offset(&self, short: Opcode, br_size: CodeOffset, offset: i64) -> bool;

    /// Encode `inst` at the end of `buf`. Exactly `inst_size` bytes must be emitted into the
    /// instruction section.
    fn emit(
        &self,
        func: &Function,
        inst: Inst,
        regs: &RegAssignment,
        info: &EmitInfo<'_>,
        buf: &mut CodeBuffer<Self::LabelUse>,
    );

    /// Emit `count` nops.
    fn emit_nops(&self, count: u32, buf: &mut CodeBuffer<Self::LabelUse>);

    /// Size of the exception handler stub.
    fn exception_handler_size(&self) -> CodeOffset;

    /// Size of the deoptimization handler stub.
    fn deopt_handler_size(&self) -> CodeOffset;

    /// Emit the exception handler into the stub section and return its offset there.
    fn emit_exception_handler(&self, buf: &mut CodeBuffer<Self::LabelUse>) -> CodeOffset;

    /// Emit a deoptimization handler into the stub section and return its offset there.
    fn emit_deopt_handler(&self, buf: &mut CodeBuffer<Self::LabelUse>) -> CodeOffset;

    /// Close the bundle being encoded, on targets with explicit bundles.
    fn flush_bundle(&self, buf: &mut CodeBuffer<Self::LabelUse>, start_new: bool) {
        let _ = (buf, start_new);
    }
}
