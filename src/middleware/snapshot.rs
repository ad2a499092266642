//! Configuration snapshots and their bounded history.
//!
//! # Design Decisions
//! - History is a fixed-capacity ring buffer (slot arena + head index);
//!   inserting past capacity overwrites the oldest slot in O(1)
//! - Timestamps are unique and increasing per entry, so a timestamp names
//!   exactly one snapshot

use serde::Serialize;
use serde_json::Value;

use crate::health::alerts::unix_millis;
use crate::middleware::entry::{MiddlewareSettings, Phase};

pub const SNAPSHOT_CAPACITY: usize = 10;

/// Immutable capture of an entry's settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Unix time in milliseconds.
    pub timestamp: u64,
    pub revision: u64,
    pub priority: u16,
    pub routes: Vec<String>,
    pub phase: Phase,
    pub enabled: bool,
    pub config: Value,
}

impl Snapshot {
    /// Capture `settings`, stamping a time later than `previous`.
    pub(crate) fn capture(settings: &MiddlewareSettings, previous: Option<u64>) -> Self {
        let now = unix_millis();
        let timestamp = match previous {
            Some(prev) if now <= prev => prev + 1,
            _ => now,
        };
        Self {
            timestamp,
            revision: settings.revision,
            priority: settings.priority,
            routes: settings.routes.clone(),
            phase: settings.phase,
            enabled: settings.enabled,
            config: settings.config.clone(),
        }
    }

    /// Settings this snapshot restores, revision included.
    pub fn to_settings(&self) -> MiddlewareSettings {
        MiddlewareSettings {
            priority: self.priority,
            routes: self.routes.clone(),
            phase: self.phase,
            enabled: self.enabled,
            config: self.config.clone(),
            revision: self.revision,
        }
    }
}

/// Fixed-capacity history, oldest evicted first.
#[derive(Debug)]
pub struct SnapshotRing {
    slots: Vec<Option<Snapshot>>,
    /// Slot of the oldest snapshot.
    head: usize,
    len: usize,
}

impl SnapshotRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![None; capacity],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot(&self, index: usize) -> usize {
        (self.head + index) % self.capacity()
    }

    /// Insert as newest, evicting the oldest when full.
    pub fn push(&mut self, snapshot: Snapshot) {
        if self.len == self.capacity() {
            self.slots[self.head] = Some(snapshot);
            self.head = self.slot(1);
        } else {
            let slot = self.slot(self.len);
            self.slots[slot] = Some(snapshot);
            self.len += 1;
        }
    }

    /// Snapshot at logical position `index` (0 = oldest).
    pub fn get(&self, index: usize) -> Option<&Snapshot> {
        if index >= self.len {
            return None;
        }
        self.slots[self.slot(index)].as_ref()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Snapshot> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        self.len.checked_sub(1).and_then(|i| self.get(i)).map(|s| s.timestamp)
    }

    /// Position of the snapshot taken at `timestamp`.
    pub fn position_of(&self, timestamp: u64) -> Option<usize> {
        (0..self.len).find(|&i| self.get(i).is_some_and(|s| s.timestamp == timestamp))
    }

    /// Position of the newest snapshot whose settings differ from `revision`.
    pub fn latest_before(&self, revision: u64) -> Option<usize> {
        (0..self.len)
            .rev()
            .find(|&i| self.get(i).is_some_and(|s| s.revision != revision))
    }

    /// Drop every snapshot newer than position `index`.
    pub fn truncate_after(&mut self, index: usize) {
        while self.len > index + 1 {
            let slot = self.slot(self.len - 1);
            self.slots[slot] = None;
            self.len -= 1;
        }
    }

    pub fn to_vec(&self) -> Vec<Snapshot> {
        self.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(timestamp: u64, revision: u64) -> Snapshot {
        Snapshot {
            timestamp,
            revision,
            priority: 1,
            routes: vec!["*".into()],
            phase: Phase::PreRouting,
            enabled: true,
            config: Value::Null,
        }
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let mut ring = SnapshotRing::new(SNAPSHOT_CAPACITY);
        for i in 0..15 {
            ring.push(snap(i, i));
        }
        assert_eq!(ring.len(), 10);
        let stamps: Vec<u64> = ring.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, (5..15).collect::<Vec<_>>());
        assert_eq!(ring.last_timestamp(), Some(14));
    }

    #[test]
    fn test_truncate_then_push_reuses_slots() {
        let mut ring = SnapshotRing::new(3);
        for i in 0..5 {
            ring.push(snap(i, i));
        }
        // Ring holds 2, 3, 4 with head wrapped.
        let pos = ring.position_of(3).unwrap();
        ring.truncate_after(pos);
        assert_eq!(ring.to_vec().iter().map(|s| s.timestamp).collect::<Vec<_>>(), [2, 3]);

        ring.push(snap(9, 9));
        assert_eq!(ring.to_vec().iter().map(|s| s.timestamp).collect::<Vec<_>>(), [2, 3, 9]);
    }

    #[test]
    fn test_latest_before_skips_current_revision() {
        let mut ring = SnapshotRing::new(5);
        ring.push(snap(1, 0));
        ring.push(snap(2, 1));
        ring.push(snap(3, 2));

        assert_eq!(ring.latest_before(2), Some(1));
        assert_eq!(ring.latest_before(7), Some(2));

        let mut single = SnapshotRing::new(5);
        single.push(snap(1, 4));
        assert_eq!(single.latest_before(4), None);
    }

    #[test]
    fn test_capture_timestamps_are_unique() {
        let settings = snap(0, 3).to_settings();
        let a = Snapshot::capture(&settings, None);
        let b = Snapshot::capture(&settings, Some(a.timestamp));
        assert!(b.timestamp > a.timestamp);
        assert_eq!(b.revision, 3);
    }
}
