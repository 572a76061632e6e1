use std::cmp::min;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::memory::Block;
use crate::metrics::Metrics;

/// Maximum frequency counter for an entry in the cache.
const MAX_FREQUENCY_LIMIT: u8 = 3;

/// Upper bound on remembered ghost keys.
const GHOST_LIMIT: usize = 4096;

/// Which file of a table a cached block was read from. Data and index
/// files both address blocks by offset, so the kind keeps the two
/// offset spaces apart under one table id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Data,
    Index,
}

/// Cache key: a block is identified by its table, originating file, and
/// byte offset within that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub table: u64,
    pub kind: BlockKind,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Small,
    Main,
}

struct Slot {
    block: Block,
    freq: u8,
    weight: usize,
    queue: Queue,
    seq: u64,
}

/// S3-FIFO block cache, weighted by block length.
///
/// New blocks enter the small queue; blocks re-referenced while there
/// are promoted to the main queue on eviction, the rest fall out and
/// leave a ghost key behind so an early re-insert goes straight to
/// main. Evicting a block drops the cache's handle, which releases the
/// buffer once no reader still holds it.
pub struct BlockCache {
    capacity: usize,
    max_main_weight: usize,
    inner: Mutex<Inner>,
    metrics: Arc<Metrics>,
}

struct Inner {
    entries: HashMap<CacheKey, Slot>,
    /// Insertion-ordered queues of (key, seq). A node whose seq no
    /// longer matches its slot is stale and skipped on pop.
    small: VecDeque<(CacheKey, u64)>,
    main: VecDeque<(CacheKey, u64)>,
    ghost: VecDeque<CacheKey>,
    ghost_members: HashSet<CacheKey>,
    small_weight: usize,
    main_weight: usize,
    next_seq: u64,
}

impl BlockCache {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        let max_small_weight = capacity / 10;
        BlockCache {
            capacity,
            max_main_weight: capacity - max_small_weight,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                small: VecDeque::new(),
                main: VecDeque::new(),
                ghost: VecDeque::new(),
                ghost_members: HashSet::new(),
                small_weight: 0,
                main_weight: 0,
                next_seq: 0,
            }),
            metrics,
        }
    }

    /// Look up a block, retaining it for the caller on a hit.
    pub fn get(&self, key: &CacheKey) -> Option<Block> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.entries.get_mut(key) {
            slot.freq = min(slot.freq + 1, MAX_FREQUENCY_LIMIT);
            self.metrics.cache_hit();
            Some(slot.block.retain())
        } else {
            self.metrics.cache_miss();
            None
        }
    }

    /// Insert a block, evicting until it fits. Blocks larger than the
    /// whole cache are not retained at all.
    pub fn insert(&self, key: CacheKey, block: Block) {
        let weight = block.len();
        if weight > self.capacity {
            return;
        }
        let mut inner = self.inner.lock().unwrap();

        if let Some(slot) = inner.entries.get_mut(&key) {
            let (old_weight, queue) = (slot.weight, slot.queue);
            slot.block = block;
            slot.weight = weight;
            match queue {
                Queue::Small => inner.small_weight = inner.small_weight - old_weight + weight,
                Queue::Main => inner.main_weight = inner.main_weight - old_weight + weight,
            }
            return;
        }

        while inner.small_weight + inner.main_weight + weight > self.capacity {
            if !self.evict(&mut inner) {
                break;
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let queue = if inner.ghost_members.remove(&key) {
            Queue::Main
        } else {
            Queue::Small
        };
        match queue {
            Queue::Small => {
                inner.small.push_back((key, seq));
                inner.small_weight += weight;
            }
            Queue::Main => {
                inner.main.push_back((key, seq));
                inner.main_weight += weight;
            }
        }
        inner.entries.insert(
            key,
            Slot {
                block,
                freq: 0,
                weight,
                queue,
                seq,
            },
        );
    }

    /// Drop every cached block belonging to `table`. Queue nodes are
    /// left behind and skipped as stale when they surface.
    pub fn invalidate(&self, table: u64) {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<CacheKey> = inner
            .entries
            .keys()
            .filter(|k| k.table == table)
            .copied()
            .collect();
        for key in doomed {
            if let Some(slot) = inner.entries.remove(&key) {
                match slot.queue {
                    Queue::Small => inner.small_weight -= slot.weight,
                    Queue::Main => inner.main_weight -= slot.weight,
                }
            }
        }
    }

    /// Total weight of resident blocks.
    pub fn weight(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.small_weight + inner.main_weight
    }

    /// Evict one block. Returns false when nothing could be evicted.
    fn evict(&self, inner: &mut Inner) -> bool {
        if inner.main_weight >= self.max_main_weight || inner.small.is_empty() {
            self.evict_main(inner)
        } else {
            self.evict_small(inner)
        }
    }

    fn evict_small(&self, inner: &mut Inner) -> bool {
        while let Some((key, seq)) = inner.small.pop_front() {
            let promote = match inner.entries.get(&key) {
                Some(slot) if slot.seq == seq && slot.queue == Queue::Small => slot.freq > 1,
                _ => continue, // stale node
            };
            if promote {
                let slot = inner.entries.get_mut(&key).unwrap();
                slot.queue = Queue::Main;
                let weight = slot.weight;
                inner.small_weight -= weight;
                inner.main_weight += weight;
                inner.main.push_back((key, seq));
            } else {
                let slot = inner.entries.remove(&key).unwrap();
                inner.small_weight -= slot.weight;
                self.remember_ghost(inner, key);
                return true;
            }
        }
        false
    }

    fn evict_main(&self, inner: &mut Inner) -> bool {
        while let Some((key, seq)) = inner.main.pop_front() {
            let second_chance = match inner.entries.get(&key) {
                Some(slot) if slot.seq == seq && slot.queue == Queue::Main => slot.freq > 0,
                _ => continue, // stale node
            };
            if second_chance {
                let slot = inner.entries.get_mut(&key).unwrap();
                slot.freq -= 1;
                inner.main.push_back((key, seq));
            } else {
                let slot = inner.entries.remove(&key).unwrap();
                inner.main_weight -= slot.weight;
                self.remember_ghost(inner, key);
                return true;
            }
        }
        false
    }

    fn remember_ghost(&self, inner: &mut Inner, key: CacheKey) {
        if inner.ghost.len() >= GHOST_LIMIT {
            if let Some(old) = inner.ghost.pop_front() {
                inner.ghost_members.remove(&old);
            }
        }
        if inner.ghost_members.insert(key) {
            inner.ghost.push_back(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(table: u64, offset: u64) -> CacheKey {
        CacheKey {
            table,
            kind: BlockKind::Data,
            offset,
        }
    }

    fn block(len: usize, fill: u8) -> Block {
        Block::copy_from(&vec![fill; len])
    }

    fn cache(capacity: usize) -> BlockCache {
        BlockCache::new(capacity, Arc::new(Metrics::new()))
    }

    #[test]
    fn test_insert_and_get() {
        let cache = cache(1024);
        cache.insert(key(1, 0), block(100, 0xaa));
        cache.insert(key(1, 100), block(100, 0xbb));

        assert_eq!(cache.get(&key(1, 0)).unwrap()[0], 0xaa);
        assert_eq!(cache.get(&key(1, 100)).unwrap()[0], 0xbb);
        assert!(cache.get(&key(2, 0)).is_none());
        assert_eq!(cache.weight(), 200);
    }

    #[test]
    fn test_hit_retains_block() {
        let cache = cache(1024);
        let b = block(10, 1);
        cache.insert(key(1, 0), b.retain());
        assert_eq!(b.ref_count(), 2);

        let hit = cache.get(&key(1, 0)).unwrap();
        assert_eq!(b.ref_count(), 3);
        drop(hit);
        assert_eq!(b.ref_count(), 2);
    }

    #[test]
    fn test_eviction_respects_capacity_and_releases() {
        let cache = cache(300);
        let first = block(100, 1);
        cache.insert(key(1, 0), first.retain());
        cache.insert(key(1, 100), block(100, 2));
        cache.insert(key(1, 200), block(100, 3));
        assert_eq!(cache.weight(), 300);

        // Over capacity; the oldest unreferenced block is evicted and
        // its cache handle dropped.
        cache.insert(key(1, 300), block(100, 4));
        assert!(cache.weight() <= 300);
        assert!(cache.get(&key(1, 0)).is_none());
        assert_eq!(first.ref_count(), 1);
    }

    #[test]
    fn test_oversized_block_not_cached() {
        let cache = cache(100);
        cache.insert(key(1, 0), block(500, 9));
        assert!(cache.get(&key(1, 0)).is_none());
        assert_eq!(cache.weight(), 0);
    }

    #[test]
    fn test_invalidate_table() {
        let cache = cache(1024);
        cache.insert(key(1, 0), block(50, 1));
        cache.insert(key(2, 0), block(50, 2));
        cache.insert(
            CacheKey {
                table: 1,
                kind: BlockKind::Index,
                offset: 0,
            },
            block(50, 3),
        );

        cache.invalidate(1);
        assert!(cache.get(&key(1, 0)).is_none());
        assert!(cache
            .get(&CacheKey {
                table: 1,
                kind: BlockKind::Index,
                offset: 0,
            })
            .is_none());
        assert!(cache.get(&key(2, 0)).is_some());
        assert_eq!(cache.weight(), 50);
    }

    #[test]
    fn test_reinsert_after_invalidate() {
        let cache = cache(1024);
        cache.insert(key(1, 0), block(50, 1));
        cache.invalidate(1);
        cache.insert(key(1, 0), block(50, 7));
        assert_eq!(cache.get(&key(1, 0)).unwrap()[0], 7);
        assert_eq!(cache.weight(), 50);
    }

    #[test]
    fn test_kinds_do_not_collide() {
        let cache = cache(1024);
        cache.insert(key(1, 0), block(10, 1));
        cache.insert(
            CacheKey {
                table: 1,
                kind: BlockKind::Index,
                offset: 0,
            },
            block(10, 2),
        );
        assert_eq!(cache.get(&key(1, 0)).unwrap()[0], 1);
    }

    #[test]
    fn test_metrics_hit_miss() {
        let metrics = Arc::new(Metrics::new());
        let cache = BlockCache::new(1024, metrics.clone());
        cache.insert(key(1, 0), block(10, 1));
        cache.get(&key(1, 0));
        cache.get(&key(1, 999));

        let snap = metrics.snapshot();
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 1);
    }
}
