//! Result and error types representing the outcome of emitting a function.

use crate::buffer::CodeOffset;
use crate::ir::{Block, Inst};
use thiserror::Error;

/// How the surrounding compiler should react to an [`OutputError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A shared resource ran out. The function stays uncompiled for now and may be retried
    /// later.
    Resource,

    /// The function can never be compiled at this tier. Retrying would fail the same way.
    Permanent,

    /// An invariant of the output pipeline was broken. This is a compiler bug.
    Internal,
}

/// An output error.
///
/// When a function cannot be turned into machine code, the output pipeline returns one of
/// these and abandons the whole function.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutputError {
    /// The code buffer or the code cache behind it has no room left.
    #[error("CodeCache is full")]
    CodeCacheFull,

    /// The anti-dependence builder needed more pinch points than allowed.
    #[error("too many D-U pinch points in {block}")]
    TooManyPinchPoints {
        /// The block being scheduled.
        block: Block,
    },

    /// The list scheduler ran out of ready instructions while some were still unscheduled.
    ///
    /// This means the dependence graph of the block has a cycle.
    #[error("scheduler stalled in {block} with {remaining} instructions left")]
    ScheduleStalled {
        /// The block being scheduled.
        block: Block,
        /// Number of instructions that were never ready.
        remaining: usize,
    },

    /// A short branch does not reach its target once the final offsets are known.
    #[error("short branch at {offset:#x} cannot reach {target:#x}")]
    BranchOutOfRange {
        /// Offset of the branch, or of the displacement field being patched.
        offset: CodeOffset,
        /// Offset of the branch target.
        target: CodeOffset,
    },

    /// A block holds more than one branch with a short form.
    #[error("{block} has two shortenable branches: {first} and {second}")]
    ManyShortBranches {
        /// The offending block.
        block: Block,
        /// The branch found first.
        first: Inst,
        /// The branch found second.
        second: Inst,
    },

    /// Emission produced a block larger than the size used for branch shortening.
    #[error("{block} grew from {estimated} to {emitted} bytes during emission")]
    BlockSizeIncreased {
        /// The offending block.
        block: Block,
        /// Size assumed by the layout.
        estimated: CodeOffset,
        /// Size actually emitted.
        emitted: CodeOffset,
    },

    /// The schedule of a block reorders a register access incorrectly.
    #[error("bad schedule in {block}: {inst} is ordered against a conflicting register access")]
    BadSchedule {
        /// The block holding the broken order.
        block: Block,
        /// The instruction whose ordering is wrong.
        inst: Inst,
    },

    /// A null check was reached before the memory access it guards was emitted.
    #[error("null check {inst} in {block} precedes its access {memory}")]
    NullCheckBeforeAccess {
        /// The block ending with the check.
        block: Block,
        /// The null check.
        inst: Inst,
        /// The memory access it guards.
        memory: Inst,
    },

    /// A label was used by emitted code but never bound.
    #[error("label used at {offset:#x} was never bound")]
    UnboundLabel {
        /// Offset of the label use.
        offset: CodeOffset,
    },
}

impl OutputError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CodeCacheFull => ErrorKind::Resource,
            Self::TooManyPinchPoints { .. } => ErrorKind::Permanent,
            Self::ScheduleStalled { .. }
            | Self::BranchOutOfRange { .. }
            | Self::ManyShortBranches { .. }
            | Self::BlockSizeIncreased { .. }
            | Self::BadSchedule { .. }
            | Self::NullCheckBeforeAccess { .. }
            | Self::UnboundLabel { .. } => ErrorKind::Internal,
        }
    }

    /// Can the same function be compiled again later?
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Resource
    }
}

/// A convenient alias for a `Result` that uses `OutputError` as the error type.
pub type OutputResult<T> = Result<T, OutputError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;

    #[test]
    fn classification() {
        assert_eq!(OutputError::CodeCacheFull.kind(), ErrorKind::Resource);
        assert!(OutputError::CodeCacheFull.is_retryable());

        let pinch = OutputError::TooManyPinchPoints {
            block: Block::new(3),
        };
        assert_eq!(pinch.kind(), ErrorKind::Permanent);
        assert!(!pinch.is_retryable());

        let stall = OutputError::ScheduleStalled {
            block: Block::new(0),
            remaining: 2,
        };
        assert_eq!(stall.kind(), ErrorKind::Internal);
    }

    #[test]
    fn display() {
        assert_eq!(OutputError::CodeCacheFull.to_string(), "CodeCache is full");
        assert_eq!(
            OutputError::TooManyPinchPoints {
                block: Block::new(3)
            }
            .to_string(),
            "too many D-U pinch points in block3"
        );
        assert_eq!(
            OutputError::BranchOutOfRange {
                offset: 0x10,
                target: 0x200
            }
            .to_string(),
            "short branch at 0x10 cannot reach 0x200"
        );
    }
}
