//! Exception handler and implicit null check tables.
//!
//! # Format
//!
//! Both tables are keyed by code offsets and are built in ascending offset order while the
//! function is emitted, so lookups are binary searches.
//!
//! The exception handler table keeps three parallel arrays plus the handler pcs. Each call
//! site, identified by its return address, owns a range of the `bcis` and `handlers` arrays.
//! Ranges are stored by their exclusive end only; the start is the previous end:
//!
//! ```plain
//! callsites: [0x10, 0x50]        // return addresses
//! ranges:    [2, 3]              // 0x10 owns 0..2, 0x50 owns 2..3
//! bcis:      [4, 17, 4]          // handler bytecode indices
//! handlers:  [0x80, 0x90, 0xa0]  // handler code offsets
//! ```
//!
//! Handlers of one call site keep the order of the catch's successors.

use crate::buffer::CodeOffset;

/// One handler of a call site.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct HandlerEntry {
    /// Bytecode index of the handler.
    pub bci: i32,
    /// Code offset of the handler.
    pub pc: CodeOffset,
}

/// Exception handlers per call site.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct ExceptionHandlerTable {
    callsites: Vec<CodeOffset>,
    ranges: Vec<u32>,
    bcis: Vec<i32>,
    handlers: Vec<CodeOffset>,
}

impl ExceptionHandlerTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the handlers of the call returning to `return_pc`.
    ///
    /// Call sites must be added in ascending order.
    pub fn add_subtable(&mut self, return_pc: CodeOffset, entries: &[HandlerEntry]) {
        debug_assert!(self.callsites.last().is_none_or(|&last| last < return_pc));
        if entries.is_empty() {
            return;
        }
        self.callsites.push(return_pc);
        for e in entries {
            self.bcis.push(e.bci);
            self.handlers.push(e.pc);
        }
        self.ranges.push(self.bcis.len() as u32);
    }

    /// Number of call sites with handlers.
    pub fn len(&self) -> usize {
        self.callsites.len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.callsites.is_empty()
    }

    /// The handlers of the call returning to `return_pc`.
    pub fn subtable(
        &self,
        return_pc: CodeOffset,
    ) -> Option<impl Iterator<Item = HandlerEntry> + '_> {
        let idx = self.callsites.binary_search(&return_pc).ok()?;
        let start = if idx == 0 {
            0
        } else {
            self.ranges[idx - 1] as usize
        };
        let end = self.ranges[idx] as usize;
        Some(
            self.bcis[start..end]
                .iter()
                .zip(&self.handlers[start..end])
                .map(|(&bci, &pc)| HandlerEntry { bci, pc }),
        )
    }

    /// The handler for `bci` at the call returning to `return_pc`.
    pub fn lookup(&self, return_pc: CodeOffset, bci: i32) -> Option<CodeOffset> {
        self.subtable(return_pc)?
            .find(|e| e.bci == bci)
            .map(|e| e.pc)
    }

    /// Return addresses of every call site, ascending.
    pub fn callsites(&self) -> &[CodeOffset] {
        &self.callsites
    }
}

/// Faulting instructions and where execution continues when they fault.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct ImplicitNullCheckTable {
    offsets: Vec<CodeOffset>,
    continuations: Vec<CodeOffset>,
}

impl ImplicitNullCheckTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a fault at `exec_offset` continues at `cont_offset`.
    ///
    /// Entries must be appended in ascending order of `exec_offset`.
    pub fn append(&mut self, exec_offset: CodeOffset, cont_offset: CodeOffset) {
        debug_assert!(self.offsets.last().is_none_or(|&last| last < exec_offset));
        self.offsets.push(exec_offset);
        self.continuations.push(cont_offset);
    }

    /// Where execution continues after a fault at `exec_offset`.
    pub fn lookup(&self, exec_offset: CodeOffset) -> Option<CodeOffset> {
        let idx = self.offsets.binary_search(&exec_offset).ok()?;
        Some(self.continuations[idx])
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Is the table empty?
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Every `(exec_offset, cont_offset)` pair, ascending.
    pub fn iter(&self) -> impl Iterator<Item = (CodeOffset, CodeOffset)> + '_ {
        self.offsets
            .iter()
            .copied()
            .zip(self.continuations.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(bci: i32, pc: CodeOffset) -> HandlerEntry {
        HandlerEntry { bci, pc }
    }

    #[test]
    fn exception_lookup() {
        let mut t = ExceptionHandlerTable::new();
        t.add_subtable(0x10, &[h(4, 0x80), h(17, 0x90)]);
        t.add_subtable(0x30, &[]);
        t.add_subtable(0x50, &[h(4, 0xa0)]);

        assert_eq!(t.len(), 2);
        assert_eq!(t.callsites(), &[0x10, 0x50]);
        assert_eq!(t.lookup(0x10, 17), Some(0x90));
        assert_eq!(t.lookup(0x50, 4), Some(0xa0));
        assert_eq!(t.lookup(0x50, 17), None);
        assert!(t.subtable(0x30).is_none());
        let all: Vec<_> = t.subtable(0x10).unwrap().collect();
        assert_eq!(all, [h(4, 0x80), h(17, 0x90)]);
    }

    #[test]
    fn null_check_lookup() {
        let mut t = ImplicitNullCheckTable::new();
        assert!(t.is_empty());
        t.append(3, 40);
        t.append(9, 52);
        assert_eq!(t.lookup(9), Some(52));
        assert_eq!(t.lookup(4), None);
        assert_eq!(t.iter().collect::<Vec<_>>(), [(3, 40), (9, 52)]);
    }
}
