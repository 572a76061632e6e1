use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::merge::Direction;
use crate::tuple::{Key, Tuple};

/// In-memory table receiving writes: a lock-free skip list keyed by the
/// versioned key, with an approximate byte size maintained alongside.
///
/// A memtable only grows. The writer stops inserting once it rotates a
/// new one in; readers keep using the old memtable until its flushed
/// file table replaces it in the table set.
pub struct MemTable {
    id: u64,
    map: SkipMap<Key, Vec<u8>>,
    size: AtomicUsize,
    max_snapshot: AtomicU64,
}

impl MemTable {
    pub fn new(id: u64) -> MemTable {
        MemTable {
            id,
            map: SkipMap::new(),
            size: AtomicUsize::new(0),
            max_snapshot: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn put(&self, tuple: Tuple) {
        self.size.fetch_add(tuple.encoded_len(), Ordering::Relaxed);
        self.max_snapshot
            .fetch_max(tuple.key().snapshot(), Ordering::Relaxed);
        let (key, value) = (tuple.key().clone(), tuple.into_value());
        self.map.insert(key, value);
    }

    /// Greatest version of `raw` with snapshot id <= `ceiling`.
    pub fn get(&self, raw: &[u8], ceiling: u64) -> Option<Tuple> {
        let probe = Key::new(raw.to_vec(), ceiling);
        let entry = self.map.upper_bound(Bound::Included(&probe))?;
        if entry.key().raw() == raw {
            Some(Tuple::new(entry.key().clone(), entry.value().clone()))
        } else {
            None
        }
    }

    /// Approximate encoded size of the contents.
    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn tuple_count(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn max_snapshot(&self) -> u64 {
        self.max_snapshot.load(Ordering::Relaxed)
    }

    /// Iterate in `direction`, optionally from the ceiling/floor of
    /// `from`. The iterator re-seeks from its last key on every step,
    /// so it stays valid while writes keep landing in the map.
    pub fn iter(self: &Arc<Self>, direction: Direction, from: Option<&Key>) -> MemTableIter {
        MemTableIter {
            mem: Arc::clone(self),
            direction,
            from: from.cloned(),
            cursor: None,
        }
    }
}

/// Cursor-style iterator over a memtable.
pub struct MemTableIter {
    mem: Arc<MemTable>,
    direction: Direction,
    from: Option<Key>,
    cursor: Option<Key>,
}

impl Iterator for MemTableIter {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match (self.direction, &self.cursor) {
            (Direction::Ascending, Some(cursor)) => {
                self.mem.map.lower_bound(Bound::Excluded(cursor))
            }
            (Direction::Ascending, None) => match &self.from {
                Some(from) => self.mem.map.lower_bound(Bound::Included(from)),
                None => self.mem.map.front(),
            },
            (Direction::Descending, Some(cursor)) => {
                self.mem.map.upper_bound(Bound::Excluded(cursor))
            }
            (Direction::Descending, None) => match &self.from {
                Some(from) => self.mem.map.upper_bound(Bound::Included(from)),
                None => self.mem.map.back(),
            },
        }?;
        self.cursor = Some(entry.key().clone());
        Some(Ok(Tuple::new(entry.key().clone(), entry.value().clone())))
    }
}
