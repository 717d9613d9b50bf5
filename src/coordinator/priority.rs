//! Priority queueing for scrape ordering. Ordering key (smallest-first):
//! `(urgency_tier, kickoff_time, -coverage_count, not_has_primary_book)`.
//! Implemented with `std::collections::BinaryHeap` (a min-heap via
//! `Reverse`) since this is a plain data-structure choice with no need
//! for an external crate.

use crate::types::UrgencyTier;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub shared_key: String,
    pub kickoff: DateTime<Utc>,
    pub coverage_count: u8,
    pub has_primary_book: bool,
}

pub fn urgency_tier(kickoff: DateTime<Utc>, now: DateTime<Utc>) -> UrgencyTier {
    let delta = kickoff - now;
    if delta < Duration::minutes(30) {
        UrgencyTier::Imminent
    } else if delta < Duration::hours(2) {
        UrgencyTier::Soon
    } else {
        UrgencyTier::Future
    }
}

/// Sort key: smaller sorts first. `neg_coverage` realizes
/// `-coverage_count`; `not_has_primary` realizes the final tiebreak in
/// favor of primary-book events (`false` < `true`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    urgency_tier: u8,
    kickoff: DateTime<Utc>,
    neg_coverage: i8,
    not_has_primary: bool,
}

impl QueuedEvent {
    fn sort_key(&self, now: DateTime<Utc>) -> SortKey {
        SortKey {
            urgency_tier: urgency_tier(self.kickoff, now) as u8,
            kickoff: self.kickoff,
            neg_coverage: -(self.coverage_count as i8),
            not_has_primary: !self.has_primary_book,
        }
    }
}

pub struct PriorityQueue {
    heap: BinaryHeap<Reverse<(SortKey, QueuedEvent)>>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new() }
    }

    pub fn push(&mut self, event: QueuedEvent, now: DateTime<Utc>) {
        let key = event.sort_key(now);
        self.heap.push(Reverse((key, event)));
    }

    pub fn pop(&mut self) -> Option<QueuedEvent> {
        self.heap.pop().map(|Reverse((_, e))| e)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drain up to `batch_size` events in priority order.
    pub fn drain_batch(&mut self, batch_size: usize) -> Vec<QueuedEvent> {
        let mut batch = Vec::with_capacity(batch_size.min(self.len()));
        for _ in 0..batch_size {
            match self.pop() {
                Some(e) => batch.push(e),
                None => break,
            }
        }
        batch
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(key: &str, mins_to_kickoff: i64, coverage: u8, has_primary: bool, now: DateTime<Utc>) -> QueuedEvent {
        QueuedEvent {
            shared_key: key.to_string(),
            kickoff: now + Duration::minutes(mins_to_kickoff),
            coverage_count: coverage,
            has_primary_book: has_primary,
        }
    }

    #[test]
    fn imminent_events_pop_before_future_events() {
        let now = Utc::now();
        let mut q = PriorityQueue::new();
        q.push(event("future", 180, 3, true, now), now);
        q.push(event("imminent", 10, 3, true, now), now);
        assert_eq!(q.pop().unwrap().shared_key, "imminent");
        assert_eq!(q.pop().unwrap().shared_key, "future");
    }

    #[test]
    fn within_same_tier_higher_coverage_pops_first() {
        let now = Utc::now();
        let mut q = PriorityQueue::new();
        q.push(event("two_books", 10, 2, true, now), now);
        q.push(event("three_books", 10, 3, true, now), now);
        assert_eq!(q.pop().unwrap().shared_key, "three_books");
        assert_eq!(q.pop().unwrap().shared_key, "two_books");
    }

    #[test]
    fn primary_book_breaks_final_tie() {
        let now = Utc::now();
        let mut q = PriorityQueue::new();
        q.push(event("no_primary", 10, 2, false, now), now);
        q.push(event("has_primary", 10, 2, true, now), now);
        assert_eq!(q.pop().unwrap().shared_key, "has_primary");
        assert_eq!(q.pop().unwrap().shared_key, "no_primary");
    }

    #[test]
    fn drain_batch_respects_size_and_order() {
        let now = Utc::now();
        let mut q = PriorityQueue::new();
        for i in 0..5 {
            q.push(event(&format!("e{i}"), 10 + i, 3, true, now), now);
        }
        let batch = q.drain_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].shared_key, "e0");
        assert_eq!(q.len(), 2);
    }
}
