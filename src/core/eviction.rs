//! Victim selection for page reclamation.
//!
//! When the pool runs dry the scheduler offers the sequences it may evict to
//! an [`EvictionPolicy`]. Pinned sequences (those in the executing batch) are
//! never offered.

use crate::core::sequence::{Priority, SequenceId};

/// A sequence the scheduler is willing to evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub seq_id: SequenceId,
    pub priority: Priority,
    /// Admission order of the owning request.
    pub arrival_order: u64,
    /// Last engine step in which the sequence produced a token or cached a chunk.
    pub last_advanced_step: u64,
    /// Pages the eviction would release (shared pages included).
    pub num_pages: usize,
}

/// Chooses which candidate gives up its pages.
pub trait EvictionPolicy: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Pick a victim among `candidates`, or `None` to refuse.
    fn select_victim(&self, candidates: &[EvictionCandidate]) -> Option<SequenceId>;
}

/// Lowest priority first, then the sequence that advanced least recently.
///
/// Ties fall to the latest arrival, so older work keeps its progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastRecentlyAdvanced;

impl EvictionPolicy for LeastRecentlyAdvanced {
    fn name(&self) -> &'static str {
        "least-recently-advanced"
    }

    fn select_victim(&self, candidates: &[EvictionCandidate]) -> Option<SequenceId> {
        candidates
            .iter()
            .filter(|c| c.num_pages > 0)
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(a.last_advanced_step.cmp(&b.last_advanced_step))
                    .then(b.arrival_order.cmp(&a.arrival_order))
                    .then(b.seq_id.cmp(&a.seq_id))
            })
            .map(|c| c.seq_id)
    }
}

/// Lowest priority first, then the most recent arrival.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestArrival;

impl EvictionPolicy for LatestArrival {
    fn name(&self) -> &'static str {
        "latest-arrival"
    }

    fn select_victim(&self, candidates: &[EvictionCandidate]) -> Option<SequenceId> {
        candidates
            .iter()
            .filter(|c| c.num_pages > 0)
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.arrival_order.cmp(&a.arrival_order))
                    .then(b.seq_id.cmp(&a.seq_id))
            })
            .map(|c| c.seq_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(seq_id: SequenceId, priority: Priority, arrival: u64, step: u64) -> EvictionCandidate {
        EvictionCandidate {
            seq_id,
            priority,
            arrival_order: arrival,
            last_advanced_step: step,
            num_pages: 1,
        }
    }

    #[test]
    fn test_lowest_priority_first() {
        let candidates = [candidate(1, 0, 0, 1), candidate(2, -1, 1, 9), candidate(3, 5, 2, 0)];
        assert_eq!(LeastRecentlyAdvanced.select_victim(&candidates), Some(2));
        assert_eq!(LatestArrival.select_victim(&candidates), Some(2));
    }

    #[test]
    fn test_least_recently_advanced_breaks_ties() {
        let candidates = [candidate(1, 0, 0, 7), candidate(2, 0, 1, 3), candidate(3, 0, 2, 5)];
        assert_eq!(LeastRecentlyAdvanced.select_victim(&candidates), Some(2));
        assert_eq!(LatestArrival.select_victim(&candidates), Some(3));
    }

    #[test]
    fn test_sequences_without_pages_are_skipped() {
        let mut empty = candidate(1, -5, 0, 0);
        empty.num_pages = 0;
        assert_eq!(LeastRecentlyAdvanced.select_victim(&[empty]), None);
        assert_eq!(LeastRecentlyAdvanced.select_victim(&[]), None);
    }
}
