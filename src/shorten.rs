//! Branch shortening and block offset computation.
//!
//! # Pessimistic layout
//!
//! Branch targets must be known before any code is emitted, but the size of a branch depends
//! on the distance to its target. [`Layout::estimate`] breaks the cycle by sizing every block
//! as if all branches keep their long form. It also assumes the worst case for padding the
//! emitter may add:
//!
//! - alignment padding for aligned instructions and loop headers;
//! - a nop between a call and a safepoint that could end up at its return address;
//! - a nop between two instructions that must not be adjacent.
//!
//! # Shortening
//!
//! [`Layout::shorten`] then sweeps over the blocks. Each branch whose displacement fits the
//! short form is replaced, and the bytes saved shift every following block. Since moving blocks
//! closer can bring other branches into range, sweeps repeat until nothing changes. The result
//! is a new layout; the input is left alone, so shortening a stable layout again changes
//! nothing.
//!
//! The offsets of the final layout are an upper bound on the offsets the emitter produces, so
//! a short branch chosen here still reaches its target in the emitted code.

use crate::buffer::CodeOffset;
use crate::entity::EntityRef;
use crate::ir::{AvoidAdjacent, Block, Function, Inst, Opcode, RegAssignment};
use crate::isa::TargetIsa;
use crate::result::{OutputError, OutputResult};
use crate::timing;
use log::debug;

/// The one shortenable branch of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct BranchSite {
    /// The branch instruction.
    pub inst: Inst,
    /// Offset of the branch from the start of its block.
    pub offset: CodeOffset,
    /// Size of the branch in its current form.
    pub size: CodeOffset,
    /// Current opcode, long or short.
    pub opcode: Opcode,
    /// The block the branch jumps to.
    pub target: Block,
}

/// Block offsets and branch forms of a function.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct Layout {
    block_starts: Vec<CodeOffset>,
    worst_case_pad: Vec<CodeOffset>,
    branches: Vec<Option<BranchSite>>,
    stub_size: CodeOffset,
    sweeps: u32,
}

impl Layout {
    /// Size every block assuming long branches and worst case padding.
    ///
    /// A block may hold at most one branch that has a short form.
    pub fn estimate<I: TargetIsa>(
        func: &Function,
        isa: &I,
        regs: &RegAssignment,
    ) -> OutputResult<Self> {
        let nblocks = func.num_blocks();
        let unit = isa.addr_unit();
        let nop_size = isa.nop_size();

        let mut block_starts = vec![0; nblocks + 1];
        let mut worst_case_pad = vec![0; nblocks];
        let mut branches: Vec<Option<BranchSite>> = vec![None; nblocks];
        let mut stub_size = 0;

        // End offsets of the last non-leaf call and the last instruction that must not be
        // followed directly by an "avoid before" instruction.
        let mut last_call: Option<CodeOffset> = None;
        let mut last_avoid: Option<CodeOffset> = None;

        for (block, data) in func.blocks.iter() {
            let i = block.index();
            let start = block_starts[i];
            let mut blk_size = 0;

            for &inst in &data.insts {
                let inst_data = &func.insts[inst];
                let opcode = inst_data.opcode;
                let pipeline = isa.pipeline(opcode);

                blk_size += isa.inst_alignment(opcode).saturating_sub(unit);

                if inst_data.is_call() {
                    stub_size += isa.call_stub_size(func, inst);
                } else if inst_data.is_safepoint() && last_call.is_some_and(|a| a >= start) {
                    // The scheduler may move the safepoint right behind the call anywhere in
                    // this block.
                    blk_size += nop_size;
                }
                if pipeline.avoid.contains(AvoidAdjacent::BEFORE)
                    && last_avoid.is_some_and(|a| a >= start)
                {
                    blk_size += nop_size;
                }

                let size = isa.inst_size(func, inst, opcode, regs);
                if inst_data.is_branch() && isa.short_branch_version(opcode).is_some() {
                    if let Some(target) = func.non_connector_successor(block, 0) {
                        if let Some(first) = &branches[i] {
                            return Err(OutputError::ManyShortBranches {
                                block,
                                first: first.inst,
                                second: inst,
                            });
                        }
                        branches[i] = Some(BranchSite {
                            inst,
                            offset: blk_size,
                            size,
                            opcode,
                            target,
                        });
                    }
                }
                blk_size += size;

                if inst_data.is_non_leaf_call() {
                    last_call = Some(start + blk_size);
                }
                if pipeline.avoid.contains(AvoidAdjacent::AFTER) {
                    last_avoid = Some(start + blk_size);
                }
            }

            // A loop header after this block may need padding; assume the worst.
            if i + 1 < nblocks {
                let next = &func.blocks[Block::new(i + 1)];
                let max_loop_pad = next.alignment.max(unit) - unit;
                if max_loop_pad > 0 {
                    debug_assert!((max_loop_pad + unit).is_power_of_two());
                    // Keep a call or avoid instruction ending this block "last" through the pad.
                    let end = start + blk_size;
                    if last_call == Some(end) {
                        last_call = Some(end + max_loop_pad);
                    }
                    if last_avoid == Some(end) {
                        last_avoid = Some(end + max_loop_pad);
                    }
                    blk_size += max_loop_pad;
                    worst_case_pad[i + 1] = max_loop_pad;
                }
            }

            block_starts[i + 1] = start + blk_size;
        }

        let layout = Self {
            block_starts,
            worst_case_pad,
            branches,
            stub_size,
            sweeps: 0,
        };
        debug!(
            "estimated {} bytes of code and {} bytes of stubs for {nblocks} blocks",
            layout.code_size(),
            layout.stub_size
        );
        Ok(layout)
    }

    /// Replace long branches by short ones until a fixed point is reached.
    pub fn shorten<I: TargetIsa>(&self, func: &Function, isa: &I, regs: &RegAssignment) -> Self {
        let _tt = timing::shorten_branches();
        let nop_size = isa.nop_size();
        let may_be_short = |site: &BranchSite| isa.short_branch_version(site.opcode).is_some();

        let mut layout = self.clone();
        let mut has_candidate = layout.branches.iter().flatten().any(may_be_short);
        let mut progress = true;

        while has_candidate && progress {
            progress = false;
            has_candidate = false;
            layout.sweeps += 1;
            let mut adjust: CodeOffset = 0;
            // End offset of the last branch or "avoid after" branch seen in this sweep.
            let mut last_branch_end: Option<CodeOffset> = None;

            for i in 0..layout.branches.len() {
                if let Some(site) = layout.branches[i].as_mut() {
                    if let Some(short) = isa.short_branch_version(site.opcode) {
                        let br_offs = layout.block_starts[i] + site.offset;
                        let tgt = site.target.index();
                        let mut offset =
                            i64::from(layout.block_starts[tgt]) - i64::from(br_offs);
                        if tgt > i {
                            offset -= i64::from(adjust);
                        }
                        let pad = layout.worst_case_pad[i];
                        debug_assert!(i == 0 || pad == 0 || br_offs >= pad);
                        // A nop may be inserted before the branch, which lengthens a backward
                        // jump.
                        let needs_padding = last_branch_end == Some(br_offs - pad);
                        if needs_padding && offset <= 0 {
                            offset -= i64::from(nop_size);
                        }

                        if isa.is_short_branch_offset(short, site.size, offset) {
                            let new_size = isa.inst_size(func, site.inst, short, regs);
                            debug_assert!(new_size < site.size);
                            let mut diff = site.size - new_size;
                            if needs_padding
                                && isa.pipeline(short).avoid.contains(AvoidAdjacent::BEFORE)
                            {
                                site.offset += nop_size;
                                diff -= nop_size;
                            }
                            trace!(
                                "shortening {} in block{i}: {} -> {short}, saving {diff} bytes",
                                site.inst,
                                site.opcode
                            );
                            adjust += diff;
                            site.opcode = short;
                            site.size = new_size;
                            progress = true;
                        } else {
                            has_candidate = true;
                        }
                    }
                    if may_be_short(&*site)
                        || isa.pipeline(site.opcode).avoid.contains(AvoidAdjacent::AFTER)
                    {
                        last_branch_end = Some(layout.block_starts[i] + site.offset + site.size);
                    }
                }
                layout.block_starts[i + 1] -= adjust;
            }
        }

        debug!(
            "shortened to {} bytes in {} sweeps",
            layout.code_size(),
            layout.sweeps
        );
        layout
    }

    /// Check that every short branch reaches its target with the current offsets.
    pub fn verify_short_branches<I: TargetIsa>(&self, isa: &I) -> OutputResult<()> {
        for (i, site) in self.branches.iter().enumerate() {
            let Some(site) = site else { continue };
            if isa.short_branch_version(site.opcode).is_some() {
                continue;
            }
            let br_offs = self.block_starts[i] + site.offset;
            let target = self.block_starts[site.target.index()];
            let offset = i64::from(target) - i64::from(br_offs);
            if !isa.is_short_branch_offset(site.opcode, site.size, offset) {
                return Err(OutputError::BranchOutOfRange {
                    offset: br_offs,
                    target,
                });
            }
        }
        Ok(())
    }

    /// Write the chosen branch forms into `func`.
    pub fn apply_branch_forms(&self, func: &mut Function) {
        for site in self.branches.iter().flatten() {
            func.insts[site.inst].opcode = site.opcode;
        }
    }

    /// Record the final position of a block's branch after emission.
    pub(crate) fn set_branch(&mut self, block: Block, site: BranchSite) {
        self.branches[block.index()] = Some(site);
    }

    /// Set the start of `block`.
    pub(crate) fn set_block_start(&mut self, block: Block, offset: CodeOffset) {
        self.block_starts[block.index()] = offset;
    }

    /// Set the end of the code.
    pub(crate) fn set_code_end(&mut self, offset: CodeOffset) {
        if let Some(end) = self.block_starts.last_mut() {
            *end = offset;
        }
    }

    /// Offset of `block`.
    pub fn block_start(&self, block: Block) -> CodeOffset {
        self.block_starts[block.index()]
    }

    /// Offsets of every block, followed by the end of the code.
    pub fn block_starts(&self) -> &[CodeOffset] {
        &self.block_starts
    }

    /// Size of `block`, padding for the following block included.
    pub fn block_size(&self, block: Block) -> CodeOffset {
        let i = block.index();
        self.block_starts[i + 1] - self.block_starts[i]
    }

    /// Worst case loop padding before `block`.
    pub fn worst_case_pad(&self, block: Block) -> CodeOffset {
        self.worst_case_pad[block.index()]
    }

    /// The shortenable branch of `block`.
    pub fn branch(&self, block: Block) -> Option<&BranchSite> {
        self.branches[block.index()].as_ref()
    }

    /// Size of the instruction section.
    pub fn code_size(&self) -> CodeOffset {
        self.block_starts.last().copied().unwrap_or(0)
    }

    /// Size of the call stubs.
    pub fn stub_size(&self) -> CodeOffset {
        self.stub_size
    }

    /// Number of shortening sweeps that produced this layout.
    pub fn sweeps(&self) -> u32 {
        self.sweeps
    }
}
