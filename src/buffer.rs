//! In-memory representation of the code being emitted.
//!
//! A [`CodeBuffer`] has three append-only sections: constants, instructions and stubs. Each
//! section has a capacity fixed when the buffer is created from a code cache reservation.
//! Writes past the capacity are dropped and mark the section as overflowed; the emitter checks
//! for that after every instruction and abandons the function with
//! [`OutputError::CodeCacheFull`].
//!
//! Branches refer to blocks through [`MachLabel`]s. Emitting a branch records a fixup for the
//! label; all fixups are patched in [`CodeBuffer::finish`], when every label is bound. A fixup
//! whose displacement does not fit its [`LabelUse`] kind fails the function instead of producing
//! a wrong branch.

use crate::entity::{EntityRef, entity_impl};
use crate::ir::Block;
use crate::result::{OutputError, OutputResult};
use core::fmt::Debug;
use smallvec::SmallVec;

/// Offset in bytes from the beginning of a section.
pub type CodeOffset = u32;

const UNKNOWN_LABEL_OFFSET: CodeOffset = 0xffff_ffff;

/// A label refers to some offset in the instruction section of a [`CodeBuffer`].
///
/// The first labels of a buffer are reserved for the blocks of the function being emitted,
/// in block order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachLabel(u32);
entity_impl!(MachLabel, "label");

impl MachLabel {
    /// Get the label of a block.
    pub fn from_block(block: Block) -> MachLabel {
        MachLabel::new(block.index())
    }
}

/// A kind of label reference, typically one branch displacement format.
pub trait LabelUse: Clone + Copy + Debug + Eq {
    /// Largest forward distance from the use offset to the label.
    fn max_pos_range(self) -> CodeOffset;

    /// Largest backward distance from the use offset to the label.
    fn max_neg_range(self) -> CodeOffset;

    /// Number of bytes patched at the use offset.
    fn patch_size(self) -> CodeOffset;

    /// Patch `buffer`, the `patch_size()` bytes at `use_offset`, to refer to `label_offset`.
    fn patch(self, buffer: &mut [u8], use_offset: CodeOffset, label_offset: CodeOffset);
}

/// Sizes of the three sections of a code buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SectionSizes {
    /// Constant table.
    pub consts: usize,
    /// Instructions.
    pub insts: usize,
    /// Out-of-line stubs and handlers.
    pub stubs: usize,
}

impl SectionSizes {
    /// Sum of all sections.
    pub fn total(&self) -> usize {
        self.consts + self.insts + self.stubs
    }

    /// Per-section minimum of two sizes.
    pub fn min(&self, other: &SectionSizes) -> SectionSizes {
        SectionSizes {
            consts: self.consts.min(other.consts),
            insts: self.insts.min(other.insts),
            stubs: self.stubs.min(other.stubs),
        }
    }
}

/// One capacity-bounded section of a code buffer.
#[derive(Clone, Debug, Default)]
pub struct Section {
    data: Vec<u8>,
    capacity: usize,
    overflowed: bool,
}

impl Section {
    /// An empty section that can hold `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            overflowed: false,
        }
    }

    /// Current offset from the start of the section.
    pub fn cur_offset(&self) -> CodeOffset {
        self.data.len() as CodeOffset
    }

    /// Bytes left before the section is full.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// Did a write exceed the capacity?
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// The bytes written so far.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Add bytes. Writes that do not fit are dropped and mark the section overflowed.
    pub fn put_data(&mut self, data: &[u8]) {
        if data.len() > self.remaining() {
            self.overflowed = true;
            return;
        }
        self.data.extend_from_slice(data);
    }

    /// Add a byte.
    pub fn put1(&mut self, value: u8) {
        self.put_data(&[value]);
    }

    /// Add 2 bytes.
    pub fn put2(&mut self, value: u16) {
        self.put_data(&value.to_le_bytes());
    }

    /// Add 4 bytes.
    pub fn put4(&mut self, value: u32) {
        self.put_data(&value.to_le_bytes());
    }

    /// Add 8 bytes.
    pub fn put8(&mut self, value: u64) {
        self.put_data(&value.to_le_bytes());
    }

    /// Pad with zero bytes to a multiple of `align`.
    pub fn align_to(&mut self, align: CodeOffset) {
        debug_assert!(align.is_power_of_two());
        while self.cur_offset() & (align - 1) != 0 {
            self.put1(0);
            if self.overflowed {
                break;
            }
        }
    }

    fn truncate(&mut self, len: CodeOffset) {
        self.data.truncate(len as usize);
    }
}

#[derive(Clone, Copy, Debug)]
struct LabelFixup<L: LabelUse> {
    label: MachLabel,
    offset: CodeOffset,
    kind: L,
}

/// A buffer of output being emitted.
pub struct CodeBuffer<L: LabelUse> {
    consts: Section,
    insts: Section,
    stubs: Section,
    label_offsets: SmallVec<[CodeOffset; 16]>,
    fixups: SmallVec<[LabelFixup<L>; 16]>,
}

impl<L: LabelUse> CodeBuffer<L> {
    /// An empty buffer with the given section capacities.
    pub fn new(capacity: SectionSizes) -> Self {
        Self {
            consts: Section::with_capacity(capacity.consts),
            insts: Section::with_capacity(capacity.insts),
            stubs: Section::with_capacity(capacity.stubs),
            label_offsets: SmallVec::new(),
            fixups: SmallVec::new(),
        }
    }

    /// The constant section.
    pub fn consts_mut(&mut self) -> &mut Section {
        &mut self.consts
    }

    /// The stub section.
    pub fn stubs_mut(&mut self) -> &mut Section {
        &mut self.stubs
    }

    /// The instruction section.
    pub fn insts(&self) -> &Section {
        &self.insts
    }

    /// Current offset in the instruction section.
    pub fn cur_offset(&self) -> CodeOffset {
        self.insts.cur_offset()
    }

    /// Add a byte to the instruction section.
    pub fn put1(&mut self, value: u8) {
        self.insts.put1(value);
    }

    /// Add 2 bytes to the instruction section.
    pub fn put2(&mut self, value: u16) {
        self.insts.put2(value);
    }

    /// Add 4 bytes to the instruction section.
    pub fn put4(&mut self, value: u32) {
        self.insts.put4(value);
    }

    /// Add 8 bytes to the instruction section.
    pub fn put8(&mut self, value: u64) {
        self.insts.put8(value);
    }

    /// Add bytes to the instruction section.
    pub fn put_data(&mut self, data: &[u8]) {
        self.insts.put_data(data);
    }

    /// Fail unless `size` more bytes fit in the instruction section.
    pub fn ensure_remaining(&self, size: CodeOffset) -> OutputResult<()> {
        if self.is_exhausted() || self.insts.remaining() < size as usize {
            return Err(OutputError::CodeCacheFull);
        }
        Ok(())
    }

    /// Did any section overflow?
    pub fn is_exhausted(&self) -> bool {
        self.consts.overflowed || self.insts.overflowed || self.stubs.overflowed
    }

    /// Drop the last `size` bytes of the instruction section.
    ///
    /// Fixups inside the dropped bytes are discarded. No label may be bound in them.
    pub fn back_up(&mut self, size: CodeOffset) {
        let end = self.cur_offset().saturating_sub(size);
        debug_assert!(
            self.label_offsets
                .iter()
                .all(|&o| o == UNKNOWN_LABEL_OFFSET || o <= end)
        );
        self.insts.truncate(end);
        self.fixups.retain(|f| f.offset < end);
    }

    /// Allocate a label, not bound to any offset yet.
    pub fn get_label(&mut self) -> MachLabel {
        let l = MachLabel::new(self.label_offsets.len());
        self.label_offsets.push(UNKNOWN_LABEL_OFFSET);
        trace!("CodeBuffer: new label -> {l:?}");
        l
    }

    /// Reserve the first `blocks` labels for blocks.
    pub fn reserve_labels_for_blocks(&mut self, blocks: usize) {
        trace!("CodeBuffer: first {blocks} labels are for blocks");
        debug_assert!(self.label_offsets.is_empty());
        self.label_offsets.resize(blocks, UNKNOWN_LABEL_OFFSET);
    }

    /// Bind a label to the current offset. A label can only be bound once.
    pub fn bind_label(&mut self, label: MachLabel) {
        trace!(
            "CodeBuffer: bind label {label:?} at offset {}",
            self.cur_offset()
        );
        debug_assert_eq!(self.label_offsets[label.index()], UNKNOWN_LABEL_OFFSET);
        self.label_offsets[label.index()] = self.cur_offset();
    }

    /// The offset of `label`, once bound.
    pub fn label_offset(&self, label: MachLabel) -> Option<CodeOffset> {
        match self.label_offsets.get(label.index()) {
            Some(&o) if o != UNKNOWN_LABEL_OFFSET => Some(o),
            _ => None,
        }
    }

    /// Refer to `label` from the field at `offset`. The field is patched in
    /// [`finish`](Self::finish).
    pub fn use_label_at_offset(&mut self, offset: CodeOffset, label: MachLabel, kind: L) {
        trace!("CodeBuffer: use_label_at_offset: offset {offset} label {label:?} kind {kind:?}");
        self.fixups.push(LabelFixup {
            label,
            offset,
            kind,
        });
    }

    /// Patch every label use and return the finished sections.
    pub fn finish(mut self) -> OutputResult<FinalizedCodeBuffer> {
        if self.is_exhausted() {
            return Err(OutputError::CodeCacheFull);
        }
        let fixups = core::mem::take(&mut self.fixups);
        for LabelFixup {
            label,
            offset,
            kind,
        } in fixups
        {
            let Some(label_offset) = self.label_offset(label) else {
                return Err(OutputError::UnboundLabel { offset });
            };
            let in_range = if label_offset >= offset {
                label_offset - offset <= kind.max_pos_range()
            } else {
                offset - label_offset <= kind.max_neg_range()
            };
            if !in_range {
                return Err(OutputError::BranchOutOfRange {
                    offset,
                    target: label_offset,
                });
            }
            let start = offset as usize;
            let end = start + kind.patch_size() as usize;
            let Some(slice) = self.insts.data.get_mut(start..end) else {
                return Err(OutputError::UnboundLabel { offset });
            };
            kind.patch(slice, offset, label_offset);
        }
        Ok(FinalizedCodeBuffer {
            consts: self.consts.data,
            insts: self.insts.data,
            stubs: self.stubs.data,
        })
    }
}

/// The sections of a finished code buffer, with every label use patched.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct FinalizedCodeBuffer {
    consts: Vec<u8>,
    insts: Vec<u8>,
    stubs: Vec<u8>,
}

impl FinalizedCodeBuffer {
    /// The constant table.
    pub fn consts(&self) -> &[u8] {
        &self.consts
    }

    /// The instructions.
    pub fn insts(&self) -> &[u8] {
        &self.insts
    }

    /// Stubs and handlers.
    pub fn stubs(&self) -> &[u8] {
        &self.stubs
    }

    /// Sizes of the three sections.
    pub fn sizes(&self) -> SectionSizes {
        SectionSizes {
            consts: self.consts.len(),
            insts: self.insts.len(),
            stubs: self.stubs.len(),
        }
    }

    /// Total size of the code.
    pub fn total_size(&self) -> usize {
        self.sizes().total()
    }
}
