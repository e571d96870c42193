//! Counting of items held in memory.
//!
//! A [`ResidencyTracker`] is a shared counter of resident items with a high-water mark. Every
//! [`SortingCollection`](super::SortingCollection) counts into its own tracker and, optionally,
//! into one tracker shared by all collections that are alive at the same time, so the combined
//! peak can be checked against a single budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared count of resident items and its peak.
///
/// Clones observe and update the same counters.
#[derive(Debug, Clone, Default)]
pub struct ResidencyTracker {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ResidencyTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `n` items entering memory.
    pub fn acquire(&self, n: usize) {
        if n == 0 {
            return;
        }
        let now = self.current.fetch_add(n, Ordering::SeqCst) + n;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    /// Records `n` items leaving memory.
    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let _ = self.current.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some(current.saturating_sub(n))
        });
    }

    /// Items currently resident.
    #[must_use]
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Largest number of items resident at once.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A collection's own tracker plus the optional tracker it shares with other collections.
#[derive(Debug, Clone, Default)]
pub(crate) struct Residency {
    local: ResidencyTracker,
    shared: Option<ResidencyTracker>,
}

impl Residency {
    pub(crate) fn new(shared: Option<ResidencyTracker>) -> Self {
        Self { local: ResidencyTracker::new(), shared }
    }

    pub(crate) fn acquire(&self, n: usize) {
        self.local.acquire(n);
        if let Some(shared) = &self.shared {
            shared.acquire(n);
        }
    }

    pub(crate) fn release(&self, n: usize) {
        self.local.release(n);
        if let Some(shared) = &self.shared {
            shared.release(n);
        }
    }

    /// Releases everything this collection still counts as resident.
    pub(crate) fn release_all(&self) {
        self.release(self.local.current());
    }

    pub(crate) fn peak(&self) -> usize {
        self.local.peak()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_records_peak() {
        let tracker = ResidencyTracker::new();
        tracker.acquire(3);
        tracker.acquire(2);
        tracker.release(4);
        tracker.acquire(1);
        assert_eq!(tracker.current(), 2);
        assert_eq!(tracker.peak(), 5);
    }

    #[test]
    fn test_release_saturates() {
        let tracker = ResidencyTracker::new();
        tracker.acquire(1);
        tracker.release(5);
        assert_eq!(tracker.current(), 0);
    }

    #[test]
    fn test_residency_counts_into_shared_tracker() {
        let shared = ResidencyTracker::new();
        let a = Residency::new(Some(shared.clone()));
        let b = Residency::new(Some(shared.clone()));
        a.acquire(4);
        b.acquire(3);
        assert_eq!(shared.peak(), 7);
        assert_eq!(a.peak(), 4);

        a.release_all();
        assert_eq!(shared.current(), 3);
        b.release_all();
        assert_eq!(shared.current(), 0);
    }
}
