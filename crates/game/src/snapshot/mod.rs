mod delta;
mod idpool;
mod storage;

pub use delta::{SnapError, SnapshotDelta};
pub use idpool::{DEFAULT_ID_CAPACITY, DEFAULT_REUSE_DELAY, SnapIdPool};
pub use storage::SnapshotStorage;

use std::collections::HashMap;
use std::sync::OnceLock;

/// Default byte budget for one tick's snapshot.
pub const MAX_SNAPSHOT_SIZE: usize = 64 * 1024;

/// Compressed bytes carried per snapshot part; larger deltas are split
/// across several Snap messages.
pub const MAX_SNAPSHOT_PACK: usize = 900;

pub fn item_key(item_type: i32, id: i32) -> i32 {
    (item_type << 16) | (id & 0xffff)
}

pub fn key_type(key: i32) -> i32 {
    (key >> 16) & 0xffff
}

pub fn key_id(key: i32) -> i32 {
    key & 0xffff
}

/// One networked object record: a (type, id) key and its payload words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapItem {
    pub key: i32,
    pub data: Vec<i32>,
}

impl SnapItem {
    pub fn item_type(&self) -> i32 {
        key_type(self.key)
    }

    pub fn id(&self) -> i32 {
        key_id(self.key)
    }
}

/// The sealed world state for one recipient at one tick. Items keep their
/// write order; (type, id) pairs are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    items: Vec<SnapItem>,
    index: HashMap<i32, usize>,
}

impl Snapshot {
    pub fn from_items(items: Vec<SnapItem>) -> Self {
        let index = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.key, i))
            .collect();
        Self { items, index }
    }

    /// The shared delta base for clients without an acked snapshot.
    pub fn empty() -> &'static Snapshot {
        static EMPTY: OnceLock<Snapshot> = OnceLock::new();
        EMPTY.get_or_init(Snapshot::default)
    }

    pub fn items(&self) -> &[SnapItem] {
        &self.items
    }

    pub fn get(&self, key: i32) -> Option<&SnapItem> {
        self.index.get(&key).map(|&i| &self.items[i])
    }

    pub fn contains(&self, key: i32) -> bool {
        self.index.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn data_bytes(&self) -> usize {
        self.items.iter().map(|item| item.data.len() * 4).sum()
    }

    /// Wrapping sum over every payload word; cheap corruption check the
    /// client can verify against the crc in the snapshot messages.
    pub fn crc(&self) -> i32 {
        let mut crc = 0i32;
        for item in &self.items {
            for &word in &item.data {
                crc = crc.wrapping_add(word);
            }
        }
        crc
    }
}

/// Accumulates the object writes of one tick and seals them into a
/// [`Snapshot`].
#[derive(Debug)]
pub struct SnapshotBuilder {
    items: Vec<SnapItem>,
    index: HashMap<i32, usize>,
    data_bytes: usize,
    budget: usize,
    recipient: Option<usize>,
}

impl SnapshotBuilder {
    pub fn new(budget: usize) -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            data_bytes: 0,
            budget,
            recipient: None,
        }
    }

    /// Resets the accumulation buffer for a new tick. `None` is the
    /// demo/all recipient.
    pub fn init(&mut self, recipient: Option<usize>) {
        self.items.clear();
        self.index.clear();
        self.data_bytes = 0;
        self.recipient = recipient;
    }

    pub fn recipient(&self) -> Option<usize> {
        self.recipient
    }

    /// Reserves one zeroed record and hands out its payload. Returns None
    /// when the tick's byte budget is exhausted; the simulation skips the
    /// object for this tick.
    pub fn new_item(&mut self, item_type: i32, id: i32, words: usize) -> Option<&mut [i32]> {
        let key = item_key(item_type, id);
        if let Some(&i) = self.index.get(&key) {
            // the same object written twice in one tick: hand the record
            // out again rather than duplicating the key
            let item = &mut self.items[i];
            self.data_bytes -= item.data.len() * 4;
            if self.data_bytes + words * 4 > self.budget {
                self.data_bytes += item.data.len() * 4;
                return None;
            }
            item.data = vec![0; words];
            self.data_bytes += words * 4;
            return Some(&mut item.data);
        }
        if self.data_bytes + words * 4 > self.budget {
            return None;
        }
        self.data_bytes += words * 4;
        self.index.insert(key, self.items.len());
        self.items.push(SnapItem {
            key,
            data: vec![0; words],
        });
        Some(&mut self.items.last_mut().unwrap().data)
    }

    /// Seals the buffer. The builder is left empty, ready for re-init.
    pub fn finish(&mut self) -> Snapshot {
        let items = std::mem::take(&mut self.items);
        let index = std::mem::take(&mut self.index);
        self.data_bytes = 0;
        Snapshot { items, index }
    }
}
