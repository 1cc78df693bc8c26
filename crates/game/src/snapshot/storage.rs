use std::collections::VecDeque;

use super::Snapshot;

/// A few seconds' worth of sent snapshots for one client, kept so an acked
/// tick can serve as a delta base. Old entries are purged every tick; a
/// base that has been purged forces a full (empty-base) delta.
#[derive(Debug, Default)]
pub struct SnapshotStorage {
    entries: VecDeque<(i32, Snapshot)>,
}

impl SnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the snapshot sent at `tick`. Ticks only move forward.
    pub fn add(&mut self, tick: i32, snapshot: Snapshot) {
        debug_assert!(
            self.entries.back().is_none_or(|(t, _)| *t < tick),
            "snapshots must be stored in tick order"
        );
        self.entries.push_back((tick, snapshot));
    }

    pub fn get(&self, tick: i32) -> Option<&Snapshot> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tick)
            .map(|(_, snap)| snap)
    }

    /// Drops every snapshot older than `min_tick`.
    pub fn purge_until(&mut self, min_tick: i32) {
        while let Some((tick, _)) = self.entries.front() {
            if *tick < min_tick {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn purge_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotBuilder;

    fn snap(word: i32) -> Snapshot {
        let mut builder = SnapshotBuilder::new(1024);
        builder.init(None);
        builder.new_item(1, 1, 1).unwrap()[0] = word;
        builder.finish()
    }

    #[test]
    fn test_get_by_tick() {
        let mut storage = SnapshotStorage::new();
        storage.add(10, snap(1));
        storage.add(12, snap(2));
        assert!(storage.get(10).is_some());
        assert!(storage.get(11).is_none());
        assert_eq!(storage.get(12).unwrap().crc(), 2);
    }

    #[test]
    fn test_purge_drops_stale_bases() {
        let mut storage = SnapshotStorage::new();
        for tick in [10, 12, 14, 16] {
            storage.add(tick, snap(tick));
        }
        storage.purge_until(14);
        assert!(storage.get(10).is_none());
        assert!(storage.get(12).is_none());
        assert!(storage.get(14).is_some());
        assert_eq!(storage.len(), 2);
    }
}
