use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::{SnapItem, Snapshot, item_key, key_type};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SnapError {
    #[error("delta data truncated")]
    Truncated,
    #[error("negative count or size in delta")]
    Corrupt,
    #[error("delta updates an item missing from the base")]
    MissingBase,
}

/// Computes and applies minimal diffs between two snapshots.
///
/// Types with a registered static size have a fixed payload width on the
/// wire; everything past that width is a protocol-variant tail that is
/// neither compared nor transmitted. Registering the same type again
/// overwrites the previous width (last write wins), which is how the
/// caller switches between wire profiles per recipient.
#[derive(Debug, Default)]
pub struct SnapshotDelta {
    static_sizes: HashMap<i32, usize>,
}

impl SnapshotDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_static_size(&mut self, item_type: i32, words: usize) {
        self.static_sizes.insert(item_type, words);
    }

    pub fn static_size(&self, item_type: i32) -> Option<usize> {
        self.static_sizes.get(&item_type).copied()
    }

    fn payload<'a>(&self, item: &'a SnapItem) -> &'a [i32] {
        match self.static_size(item.item_type()) {
            Some(width) => &item.data[..width.min(item.data.len())],
            None => &item.data,
        }
    }

    /// Serializes the difference from `base` to `target`: varint counts of
    /// removed/added/updated records, the removed keys (base order), the
    /// added records (target order: id, type, payload), and the updated
    /// records (base order: key, payload). An identical pair yields an
    /// empty buffer.
    pub fn create_delta(&self, base: &Snapshot, target: &Snapshot) -> Vec<i32> {
        let mut removed: Vec<i32> = Vec::new();
        let mut updated: Vec<&SnapItem> = Vec::new();
        let mut added: Vec<&SnapItem> = Vec::new();

        for item in base.items() {
            match target.get(item.key) {
                None => removed.push(item.key),
                Some(current) => {
                    if self.payload(item) != self.payload(current) {
                        updated.push(current);
                    }
                }
            }
        }
        for item in target.items() {
            if !base.contains(item.key) {
                added.push(item);
            }
        }

        if removed.is_empty() && added.is_empty() && updated.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        out.push(removed.len() as i32);
        out.push(added.len() as i32);
        out.push(updated.len() as i32);
        out.extend_from_slice(&removed);

        for item in added {
            let payload = self.payload(item);
            out.push(item.id());
            out.push(item.item_type());
            if self.static_size(item.item_type()).is_none() {
                out.push(payload.len() as i32);
            }
            out.extend_from_slice(payload);
        }
        for item in updated {
            let payload = self.payload(item);
            out.push(item.key);
            if self.static_size(item.item_type()).is_none() {
                out.push(payload.len() as i32);
            }
            out.extend_from_slice(payload);
        }
        out
    }

    /// Reconstructs the target snapshot from a base and a serialized
    /// delta. Surviving base items keep their order with updates applied
    /// in place; added items are appended in delta order, which makes
    /// create/apply/create re-derivation byte-stable.
    pub fn apply_delta(&self, base: &Snapshot, delta: &[i32]) -> Result<Snapshot, SnapError> {
        if delta.is_empty() {
            return Ok(base.clone());
        }

        let mut cursor = Cursor::new(delta);
        let num_removed = cursor.count()?;
        let num_added = cursor.count()?;
        let num_updated = cursor.count()?;

        let mut removed = HashSet::with_capacity(num_removed);
        for _ in 0..num_removed {
            removed.insert(cursor.word()?);
        }

        let mut items: Vec<SnapItem> = base
            .items()
            .iter()
            .filter(|item| !removed.contains(&item.key))
            .cloned()
            .collect();
        let mut index: HashMap<i32, usize> = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.key, i))
            .collect();

        for _ in 0..num_added {
            let id = cursor.word()?;
            let item_type = cursor.word()?;
            let words = match self.static_size(item_type) {
                Some(width) => width,
                None => cursor.count()?,
            };
            let data = cursor.words(words)?.to_vec();
            let key = item_key(item_type, id);
            match index.get(&key) {
                Some(&i) => items[i].data = data,
                None => {
                    index.insert(key, items.len());
                    items.push(SnapItem { key, data });
                }
            }
        }

        for _ in 0..num_updated {
            let key = cursor.word()?;
            let words = match self.static_size(key_type(key)) {
                Some(width) => width,
                None => cursor.count()?,
            };
            let data = cursor.words(words)?.to_vec();
            let &i = index.get(&key).ok_or(SnapError::MissingBase)?;
            let keep_tail = items[i].data.len().saturating_sub(data.len());
            if keep_tail > 0 {
                // static width shorter than the stored payload: the tail is
                // the variant-specific part and survives the update
                items[i].data[..data.len()].copy_from_slice(&data);
            } else {
                items[i].data = data;
            }
        }

        Ok(Snapshot::from_items(items))
    }
}

struct Cursor<'a> {
    data: &'a [i32],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [i32]) -> Self {
        Self { data, pos: 0 }
    }

    fn word(&mut self) -> Result<i32, SnapError> {
        let w = *self.data.get(self.pos).ok_or(SnapError::Truncated)?;
        self.pos += 1;
        Ok(w)
    }

    fn count(&mut self) -> Result<usize, SnapError> {
        let w = self.word()?;
        if w < 0 || w as usize > self.data.len() {
            return Err(SnapError::Corrupt);
        }
        Ok(w as usize)
    }

    fn words(&mut self, n: usize) -> Result<&'a [i32], SnapError> {
        if self.pos + n > self.data.len() {
            return Err(SnapError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}
