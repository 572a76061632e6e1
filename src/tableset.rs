use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::Result;
use crate::memtable::MemTable;
use crate::merge::{Direction, TupleIter};
use crate::sstable::FileTable;
use crate::tuple::{Key, Tuple};
use std::sync::Arc;

/// A table in the live set: the active or a still-flushing memtable, or
/// a published file table. Ids are assigned from one sequence, so a
/// lower id always means older data.
#[derive(Clone)]
pub enum TableRef {
    Mem(Arc<MemTable>),
    File(Arc<FileTable>),
}

impl TableRef {
    pub fn id(&self) -> u64 {
        match self {
            TableRef::Mem(mem) => mem.id(),
            TableRef::File(file) => file.id(),
        }
    }

    pub fn level(&self) -> u32 {
        match self {
            TableRef::Mem(_) => 0,
            TableRef::File(file) => file.level(),
        }
    }

    /// Memtables are always probed; file tables answer from their
    /// bloom filter.
    pub fn might_contain(&self, raw: &[u8]) -> bool {
        match self {
            TableRef::Mem(_) => true,
            TableRef::File(file) => file.might_contain(raw),
        }
    }

    pub fn get(&self, raw: &[u8], ceiling: u64) -> Result<Option<Tuple>> {
        match self {
            TableRef::Mem(mem) => Ok(mem.get(raw, ceiling)),
            TableRef::File(file) => file.get(raw, ceiling),
        }
    }

    pub fn iter(&self, direction: Direction, from: Option<&Key>) -> Result<TupleIter> {
        Ok(match self {
            TableRef::Mem(mem) => Box::new(mem.iter(direction, from)),
            TableRef::File(file) => Box::new(file.iter(direction, from)?),
        })
    }
}

type Observer = Box<dyn Fn() + Send + Sync>;

/// Registry of live tables.
///
/// Mutations go through a write lock, bump the version counter, and
/// notify subscribed observers after the lock is released. Long-lived
/// scans compare the version they were built against and rebind when it
/// has moved.
pub struct TableSet {
    tables: RwLock<Vec<TableRef>>,
    observers: RwLock<Vec<Observer>>,
    next_id: AtomicU64,
    version: AtomicU64,
}

impl TableSet {
    pub fn new(next_id: u64) -> TableSet {
        TableSet {
            tables: RwLock::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(next_id.max(1)),
            version: AtomicU64::new(0),
        }
    }

    /// Claim the next table id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Register a callback fired after every mutation.
    pub fn subscribe(&self, observer: Observer) {
        self.observers.write().unwrap().push(observer);
    }

    /// Snapshot of the live tables, oldest first.
    pub fn tables(&self) -> Vec<TableRef> {
        self.tables.read().unwrap().clone()
    }

    /// Snapshot of the published file tables, oldest first.
    pub fn file_tables(&self) -> Vec<Arc<FileTable>> {
        self.tables
            .read()
            .unwrap()
            .iter()
            .filter_map(|t| match t {
                TableRef::File(file) => Some(Arc::clone(file)),
                TableRef::Mem(_) => None,
            })
            .collect()
    }

    pub fn add(&self, table: TableRef) {
        {
            let mut tables = self.tables.write().unwrap();
            let at = tables.partition_point(|t| t.id() < table.id());
            tables.insert(at, table);
        }
        self.mutated();
    }

    pub fn remove(&self, id: u64) -> Option<TableRef> {
        let removed = {
            let mut tables = self.tables.write().unwrap();
            let at = tables.iter().position(|t| t.id() == id)?;
            Some(tables.remove(at))
        };
        self.mutated();
        removed
    }

    /// Atomically replace `old_ids` with `new`. Used when a flushed
    /// memtable becomes a file table (same id) and when compaction
    /// replaces its inputs with the merged output.
    pub fn swap(&self, old_ids: &[u64], new: TableRef) -> Vec<TableRef> {
        let removed = {
            let mut tables = self.tables.write().unwrap();
            let mut removed = Vec::with_capacity(old_ids.len());
            tables.retain(|t| {
                if old_ids.contains(&t.id()) {
                    removed.push(t.clone());
                    false
                } else {
                    true
                }
            });
            let at = tables.partition_point(|t| t.id() < new.id());
            tables.insert(at, new);
            removed
        };
        self.mutated();
        removed
    }

    fn mutated(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
        for observer in self.observers.read().unwrap().iter() {
            observer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn mem(id: u64) -> TableRef {
        TableRef::Mem(Arc::new(MemTable::new(id)))
    }

    #[test]
    fn test_ids_are_monotonic() {
        let set = TableSet::new(1);
        assert_eq!(set.next_id(), 1);
        assert_eq!(set.next_id(), 2);

        let seeded = TableSet::new(40);
        assert_eq!(seeded.next_id(), 40);
    }

    #[test]
    fn test_add_keeps_id_order() {
        let set = TableSet::new(1);
        set.add(mem(5));
        set.add(mem(2));
        set.add(mem(9));

        let ids: Vec<u64> = set.tables().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn test_version_bumps_on_mutation() {
        let set = TableSet::new(1);
        let v0 = set.version();
        set.add(mem(1));
        let v1 = set.version();
        assert!(v1 > v0);
        set.remove(1);
        assert!(set.version() > v1);
    }

    #[test]
    fn test_swap_replaces_many_with_one() {
        let set = TableSet::new(1);
        set.add(mem(1));
        set.add(mem(2));
        set.add(mem(3));

        let removed = set.swap(&[1, 2], mem(4));
        assert_eq!(removed.len(), 2);

        let ids: Vec<u64> = set.tables().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_observers_fire_after_mutation() {
        let set = TableSet::new(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = fired.clone();
        set.subscribe(Box::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        set.add(mem(1));
        set.remove(1);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
