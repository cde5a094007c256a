//! Min-heap index over deferred publish tasks.
//!
//! Keyed `(scheduled_time, publish_id)`. Cancellation and rescheduling use
//! lazy deletion: the heap keeps stale entries and an authoritative map of
//! the latest time per id decides validity at pop time, because in-place
//! removal from a binary heap is O(n).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    scheduled_time: DateTime<Utc>,
    publish_id: Uuid,
}

#[derive(Debug, Default)]
pub struct PublishHeap {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    active: HashMap<Uuid, DateTime<Utc>>,
}

impl PublishHeap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or move an entry. A later push for the same id supersedes any
    /// earlier one.
    pub fn push(&mut self, publish_id: Uuid, scheduled_time: DateTime<Utc>) {
        self.active.insert(publish_id, scheduled_time);
        self.heap.push(Reverse(HeapEntry {
            scheduled_time,
            publish_id,
        }));
    }

    /// Lazy removal; the stale heap entry is skipped at pop time.
    pub fn cancel(&mut self, publish_id: Uuid) {
        self.active.remove(&publish_id);
    }

    fn entry_is_live(&self, entry: &HeapEntry) -> bool {
        self.active.get(&entry.publish_id) == Some(&entry.scheduled_time)
    }

    /// Earliest live scheduled time, discarding stale entries on the way.
    pub fn next_due(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.entry_is_live(entry) {
                return Some(entry.scheduled_time);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop all live entries due at or before `now`.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.entry_is_live(entry) && entry.scheduled_time > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked entry exists");
            if self.entry_is_live(&entry) {
                self.active.remove(&entry.publish_id);
                due.push(entry.publish_id);
            }
        }
        due
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts)
            .expect("valid timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn pops_in_time_order_with_id_tiebreak() {
        let mut heap = PublishHeap::new();
        let early = Uuid::new_v4();
        let late = Uuid::new_v4();
        heap.push(late, at("2026-03-01T10:00:15Z"));
        heap.push(early, at("2026-03-01T10:00:05Z"));

        assert_eq!(heap.next_due(), Some(at("2026-03-01T10:00:05Z")));
        let due = heap.pop_due(at("2026-03-01T10:00:20Z"));
        assert_eq!(due, vec![early, late]);
        assert!(heap.is_empty());
    }

    #[test]
    fn nothing_pops_before_its_time() {
        let mut heap = PublishHeap::new();
        let id = Uuid::new_v4();
        heap.push(id, at("2026-03-01T10:00:10Z"));
        assert!(heap.pop_due(at("2026-03-01T10:00:09Z")).is_empty());
        assert_eq!(heap.pop_due(at("2026-03-01T10:00:10Z")), vec![id]);
    }

    #[test]
    fn cancelled_entries_are_skipped() {
        let mut heap = PublishHeap::new();
        let kept = Uuid::new_v4();
        let dropped = Uuid::new_v4();
        heap.push(dropped, at("2026-03-01T10:00:05Z"));
        heap.push(kept, at("2026-03-01T10:00:10Z"));
        heap.cancel(dropped);

        assert_eq!(heap.len(), 1);
        assert_eq!(heap.next_due(), Some(at("2026-03-01T10:00:10Z")));
        assert_eq!(heap.pop_due(at("2026-03-01T10:01:00Z")), vec![kept]);
    }

    #[test]
    fn reschedule_supersedes_the_old_entry() {
        let mut heap = PublishHeap::new();
        let id = Uuid::new_v4();
        heap.push(id, at("2026-03-01T10:00:05Z"));
        heap.push(id, at("2026-03-01T10:00:30Z"));

        // The old, earlier entry is stale and must not fire.
        assert!(heap.pop_due(at("2026-03-01T10:00:10Z")).is_empty());
        assert_eq!(heap.pop_due(at("2026-03-01T10:00:30Z")), vec![id]);
        assert!(heap.is_empty());
    }

    #[test]
    fn reschedule_earlier_also_works() {
        let mut heap = PublishHeap::new();
        let id = Uuid::new_v4();
        heap.push(id, at("2026-03-01T10:00:30Z"));
        heap.push(id, at("2026-03-01T10:00:05Z"));
        assert_eq!(heap.pop_due(at("2026-03-01T10:00:05Z")), vec![id]);
        // The stale later entry is discarded silently.
        assert!(heap.pop_due(at("2026-03-01T11:00:00Z")).is_empty());
    }
}
