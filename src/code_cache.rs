//! Storage reservations for emitted code.
//!
//! Before emission, the output pipeline asks a [`CodeCache`] for room for a worst-case sized
//! buffer. The cache may be shared between compiler threads and may refuse. A refusal fails
//! the compile with [`OutputError::CodeCacheFull`](crate::OutputError::CodeCacheFull); the
//! output pipeline never retries.

use crate::buffer::SectionSizes;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A source of code buffer storage.
pub trait CodeCache: Sync {
    /// Reserve room for `request`. Returns the capacities granted, which may be smaller than
    /// requested, or `None` when nothing can be granted.
    fn reserve(&self, request: SectionSizes) -> Option<SectionSizes>;
}

/// A cache without limit. Every request is granted in full.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnlimitedCodeCache;

impl CodeCache for UnlimitedCodeCache {
    fn reserve(&self, request: SectionSizes) -> Option<SectionSizes> {
        Some(request)
    }
}

/// A cache with a total byte budget shared by every compile using it.
///
/// Requests are granted in full or not at all. Granted bytes are never returned.
#[derive(Debug)]
pub struct CodeCacheBudget {
    available: AtomicUsize,
}

impl CodeCacheBudget {
    /// A cache with `bytes` of room.
    pub fn new(bytes: usize) -> Self {
        Self {
            available: AtomicUsize::new(bytes),
        }
    }

    /// Bytes not reserved yet.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }
}

impl CodeCache for CodeCacheBudget {
    fn reserve(&self, request: SectionSizes) -> Option<SectionSizes> {
        let total = request.total();
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avail| {
                avail.checked_sub(total)
            })
            .ok()
            .map(|_| request)
    }
}

/// A cache granting at most fixed per-section capacities.
///
/// Requests larger than the limits are granted partially, so the failure shows up while
/// emitting instead of at reservation time.
#[derive(Clone, Copy, Debug)]
pub struct SectionLimits(pub SectionSizes);

impl CodeCache for SectionLimits {
    fn reserve(&self, request: SectionSizes) -> Option<SectionSizes> {
        Some(request.min(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn req(insts: usize) -> SectionSizes {
        SectionSizes {
            consts: 0,
            insts,
            stubs: 16,
        }
    }

    #[test]
    fn budget_is_all_or_nothing() {
        let cache = CodeCacheBudget::new(100);
        assert_eq!(cache.reserve(req(64)), Some(req(64)));
        assert_eq!(cache.available(), 20);
        assert_eq!(cache.reserve(req(8)), None);
        assert_eq!(cache.available(), 20);
        assert_eq!(cache.reserve(req(4)), Some(req(4)));
        assert_eq!(cache.available(), 0);
    }

    #[test]
    fn budget_shared_between_threads() {
        let cache = Arc::new(CodeCacheBudget::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.reserve(req(84)).is_some())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(granted, 8);
        assert_eq!(cache.available(), 1000 - 8 * 100);
    }

    #[test]
    fn limits_clamp() {
        let limits = SectionLimits(SectionSizes {
            consts: 8,
            insts: 10,
            stubs: 8,
        });
        assert_eq!(
            limits.reserve(req(64)),
            Some(SectionSizes {
                consts: 0,
                insts: 10,
                stubs: 8
            })
        );
    }
}
