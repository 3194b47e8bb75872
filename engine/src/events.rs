//! Coalescing of push events.
//!
//! Without debouncing every event flushes immediately. With a debounce
//! window, upserts (`created`, `updated`, `patched`) and removals queue in two
//! lanes keyed by identity. The last event for an identity wins, and an
//! arrival in one lane evicts that identity from the other. Each lane flushes
//! once its deadline passes:
//!
//! ```text
//! deadline = min(last_arrival + wait, first_arrival + max(max_wait, wait))
//! ```
//!
//! The queue never reads a clock. Callers pass millisecond timestamps.

use crate::{EventKind, Identity, Record, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default upper bound on how long a lane may be held back.
pub const DEFAULT_MAX_WAIT_MS: u64 = 1000;

/// Debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Debounce {
    pub wait: u64,
    pub max_wait: u64,
}

impl Debounce {
    pub fn new(wait: u64) -> Self {
        Self {
            wait,
            max_wait: DEFAULT_MAX_WAIT_MS,
        }
    }

    pub fn with_max_wait(mut self, max_wait: u64) -> Self {
        self.max_wait = max_wait;
        self
    }

    fn effective_max_wait(&self) -> u64 {
        self.max_wait.max(self.wait)
    }
}

/// A batch of events ready to be applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flush {
    pub upserts: Vec<Record>,
    pub removals: Vec<Record>,
}

impl Flush {
    fn single(kind: EventKind, record: Record) -> Self {
        if kind.is_removal() {
            Self {
                upserts: Vec::new(),
                removals: vec![record],
            }
        } else {
            Self {
                upserts: vec![record],
                removals: Vec::new(),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.removals.len()
    }
}

#[derive(Debug, Clone, Default)]
struct Lane {
    order: Vec<Identity>,
    records: HashMap<Identity, Record>,
    first_at: Option<Timestamp>,
    last_at: Timestamp,
}

impl Lane {
    fn push(&mut self, identity: Identity, record: Record, now: Timestamp) {
        if self.records.insert(identity.clone(), record).is_none() {
            self.order.push(identity);
        }
        self.first_at.get_or_insert(now);
        self.last_at = now;
    }

    fn evict(&mut self, identity: &Identity) {
        if self.records.remove(identity).is_some() {
            self.order.retain(|existing| existing != identity);
            if self.records.is_empty() {
                self.first_at = None;
            }
        }
    }

    fn deadline(&self, debounce: &Debounce) -> Option<Timestamp> {
        let first_at = self.first_at?;
        Some(
            self.last_at
                .saturating_add(debounce.wait)
                .min(first_at.saturating_add(debounce.effective_max_wait())),
        )
    }

    fn take(&mut self) -> Vec<Record> {
        let mut records = std::mem::take(&mut self.records);
        self.first_at = None;
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|identity| records.remove(&identity))
            .collect()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Pending events of one namespace.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    debounce: Option<Debounce>,
    upserts: Lane,
    removals: Lane,
}

impl EventQueue {
    pub fn new(debounce: Option<Debounce>) -> Self {
        Self {
            debounce,
            ..Self::default()
        }
    }

    pub fn debounce(&self) -> Option<Debounce> {
        self.debounce
    }

    /// Queue an event. Returns a flush right away when not debouncing.
    pub fn enqueue(
        &mut self,
        kind: EventKind,
        identity: Identity,
        record: Record,
        now: Timestamp,
    ) -> Option<Flush> {
        if self.debounce.is_none() {
            return Some(Flush::single(kind, record));
        }

        if kind.is_removal() {
            self.upserts.evict(&identity);
            self.removals.push(identity, record, now);
        } else {
            self.removals.evict(&identity);
            self.upserts.push(identity, record, now);
        }
        None
    }

    /// Earliest time at which a lane is due.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        let debounce = self.debounce.as_ref()?;
        match (
            self.upserts.deadline(debounce),
            self.removals.deadline(debounce),
        ) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Take every lane whose deadline has passed.
    pub fn take_due(&mut self, now: Timestamp) -> Option<Flush> {
        let debounce = self.debounce?;
        let due = |lane: &Lane| lane.deadline(&debounce).is_some_and(|d| d <= now);

        let mut flush = Flush::default();
        if due(&self.upserts) {
            flush.upserts = self.upserts.take();
        }
        if due(&self.removals) {
            flush.removals = self.removals.take();
        }
        (!flush.is_empty()).then_some(flush)
    }

    /// Take everything regardless of deadlines.
    pub fn drain(&mut self) -> Option<Flush> {
        let flush = Flush {
            upserts: self.upserts.take(),
            removals: self.removals.take(),
        };
        (!flush.is_empty()).then_some(flush)
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.upserts = Lane::default();
        self.removals = Lane::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Id;
    use serde_json::json;

    fn event(id: i64, name: &str) -> (Identity, Record) {
        (
            Identity::Permanent(Id::from(id)),
            Record::from_value(json!({"id": id, "name": name})).unwrap(),
        )
    }

    fn debounced(wait: u64) -> EventQueue {
        EventQueue::new(Some(Debounce::new(wait)))
    }

    #[test]
    fn immediate_without_debounce() {
        let mut queue = EventQueue::new(None);
        let (identity, record) = event(1, "a");
        let flush = queue.enqueue(EventKind::Created, identity, record, 0).unwrap();
        assert_eq!(flush.upserts.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn last_write_wins_within_window() {
        let mut queue = debounced(20);
        for (at, name) in [(0, "a"), (5, "b"), (10, "c")] {
            let (identity, record) = event(1, name);
            assert!(queue.enqueue(EventKind::Patched, identity, record, at).is_none());
        }

        assert_eq!(queue.next_deadline(), Some(30));
        assert!(queue.take_due(29).is_none());

        let flush = queue.take_due(30).unwrap();
        assert_eq!(flush.upserts.len(), 1);
        assert_eq!(flush.upserts[0].field("name"), Some(&json!("c")));
        assert!(queue.is_empty());
        assert_eq!(queue.next_deadline(), None);
    }

    #[test]
    fn max_wait_bounds_the_window() {
        let mut queue = EventQueue::new(Some(Debounce::new(20).with_max_wait(50)));
        for at in (0..=60).step_by(10) {
            let (identity, record) = event(at as i64, "x");
            queue.enqueue(EventKind::Created, identity, record, at);
            if at < 50 {
                assert!(queue.take_due(at).is_none());
            }
        }
        // first arrival at 0, so the lane was due at 50
        let flush = queue.take_due(60).unwrap();
        assert_eq!(flush.upserts.len(), 7);
    }

    #[test]
    fn max_wait_below_wait_is_raised() {
        let mut queue = EventQueue::new(Some(Debounce::new(100).with_max_wait(10)));
        let (identity, record) = event(1, "a");
        queue.enqueue(EventKind::Created, identity, record, 0);
        assert_eq!(queue.next_deadline(), Some(100));
    }

    #[test]
    fn removal_evicts_queued_upsert() {
        let mut queue = debounced(10);
        let (identity, record) = event(1, "a");
        queue.enqueue(EventKind::Created, identity.clone(), record.clone(), 0);
        queue.enqueue(EventKind::Removed, identity.clone(), record.clone(), 1);

        let flush = queue.drain().unwrap();
        assert!(flush.upserts.is_empty());
        assert_eq!(flush.removals.len(), 1);

        queue.enqueue(EventKind::Removed, identity.clone(), record.clone(), 2);
        queue.enqueue(EventKind::Updated, identity, record, 3);
        let flush = queue.drain().unwrap();
        assert_eq!(flush.upserts.len(), 1);
        assert!(flush.removals.is_empty());
    }

    #[test]
    fn lanes_flush_independently() {
        let mut queue = debounced(10);
        let (a, record_a) = event(1, "a");
        let (b, record_b) = event(2, "b");
        queue.enqueue(EventKind::Created, a, record_a, 0);
        queue.enqueue(EventKind::Removed, b, record_b, 8);

        let flush = queue.take_due(10).unwrap();
        assert_eq!(flush.upserts.len(), 1);
        assert!(flush.removals.is_empty());
        assert_eq!(queue.next_deadline(), Some(18));
    }

    #[test]
    fn flush_keeps_arrival_order() {
        let mut queue = debounced(10);
        for id in [3, 1, 2] {
            let (identity, record) = event(id, "x");
            queue.enqueue(EventKind::Created, identity, record, 0);
        }
        let flush = queue.drain().unwrap();
        let ids: Vec<_> = flush.upserts.iter().map(|r| r.field("id").cloned()).collect();
        assert_eq!(ids, vec![Some(json!(3)), Some(json!(1)), Some(json!(2))]);
    }
}
