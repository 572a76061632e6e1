//! Startup recovery: sweep the data directory, discard partial table
//! writes, open every published table, and turn surviving WALs back
//! into tables.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::cache::BlockCache;
use crate::config::Config;
use crate::error::Result;
use crate::memtable::MemTable;
use crate::merge::Direction;
use crate::metrics::Metrics;
use crate::sstable::{FileTable, TableBuilder};
use crate::tableset::TableRef;
use crate::wal::Wal;

/// What recovery found: the live tables plus the sequence floors the
/// store resumes from.
pub struct Recovered {
    pub tables: Vec<TableRef>,
    pub next_id: u64,
    pub next_snapshot: u64,
}

/// Bring the data directory to a consistent state and load it.
///
/// Publishing is a rename of the finished `.sst.tmp`, so a `.sst` file
/// is always complete and anything else from an interrupted write is
/// garbage: temp files, and index or filter files with no table. WALs
/// with no matching table hold writes that never flushed; they are
/// rebuilt into tables here, synchronously, so the store never opens
/// with a backlog.
pub fn recover(
    config: &Config,
    cache: &Arc<BlockCache>,
    metrics: &Arc<Metrics>,
) -> Result<Recovered> {
    fs::create_dir_all(&config.dir)?;

    let mut ssts = Vec::new();
    let mut wals = Vec::new();
    let mut temps = Vec::new();
    let mut sidecars = Vec::new();
    for entry in fs::read_dir(&config.dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(id) = parse_id(name, ".sst.tmp") {
            temps.push(id);
        } else if let Some(id) = parse_id(name, ".sst") {
            ssts.push(id);
        } else if let Some(id) = parse_id(name, ".wal") {
            wals.push(id);
        } else if let Some(id) = parse_id(name, ".idx").or_else(|| parse_id(name, ".flt")) {
            sidecars.push(id);
        }
    }
    ssts.sort_unstable();

    for id in temps {
        tracing::warn!(table = id, "discarding interrupted table write");
        remove_quietly(&config.table_temp_path(id));
        if !ssts.contains(&id) {
            remove_quietly(&config.index_path(id));
            remove_quietly(&config.filter_path(id));
        }
    }
    for id in sidecars {
        if !ssts.contains(&id) {
            remove_quietly(&config.index_path(id));
            remove_quietly(&config.filter_path(id));
        }
    }

    let mut max_id = 0u64;
    let mut max_snapshot = 0u64;
    let mut tables = Vec::with_capacity(ssts.len());
    for &id in &ssts {
        let table = FileTable::open(config, id, Arc::clone(cache), Arc::clone(metrics))?;
        max_id = max_id.max(id);
        max_snapshot = max_snapshot.max(table.max_snapshot());
        tables.push(TableRef::File(Arc::new(table)));
    }

    wals.sort_unstable();
    for id in wals {
        let path = config.wal_path(id);
        if ssts.contains(&id) {
            // The flush finished; only the log deletion was lost.
            remove_quietly(&path);
            continue;
        }
        max_id = max_id.max(id);
        if let Some(table) = rebuild_from_wal(config, cache, metrics, id, &path)? {
            max_snapshot = max_snapshot.max(table.max_snapshot());
            tables.push(TableRef::File(Arc::new(table)));
        }
        remove_quietly(&path);
    }

    tracing::info!(
        tables = tables.len(),
        next_id = max_id + 1,
        "recovery complete"
    );
    Ok(Recovered {
        tables,
        next_id: max_id + 1,
        next_snapshot: max_snapshot + 1,
    })
}

/// Replay one WAL into a memtable and persist it as a level-1 table
/// under the same id. Returns `None` when the log held no records.
fn rebuild_from_wal(
    config: &Config,
    cache: &Arc<BlockCache>,
    metrics: &Arc<Metrics>,
    id: u64,
    path: &Path,
) -> Result<Option<FileTable>> {
    let mem = Arc::new(MemTable::new(id));
    for tuple in Wal::replay(path)? {
        mem.put(tuple?);
    }
    if mem.is_empty() {
        return Ok(None);
    }

    let tuples = mem.tuple_count();
    let mut builder = TableBuilder::new(config, id, 1, tuples)?;
    for tuple in mem.iter(Direction::Ascending, None) {
        builder.add(tuple?)?;
    }
    builder.finish()?;
    tracing::info!(table = id, tuples, "rebuilt table from wal");
    Ok(Some(FileTable::open(
        config,
        id,
        Arc::clone(cache),
        Arc::clone(metrics),
    )?))
}

fn parse_id(name: &str, suffix: &str) -> Option<u64> {
    name.strip_suffix(suffix)?.parse().ok()
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{Key, Tuple};
    use tempfile::TempDir;

    fn harness(dir: &TempDir) -> (Config, Arc<BlockCache>, Arc<Metrics>) {
        let config = Config::new(dir.path());
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(BlockCache::new(1 << 20, metrics.clone()));
        (config, cache, metrics)
    }

    fn tuple(raw: &[u8], snapshot: u64, value: &[u8]) -> Tuple {
        Tuple::new(Key::new(raw.to_vec(), snapshot), value.to_vec())
    }

    fn write_table(config: &Config, cache: &Arc<BlockCache>, metrics: &Arc<Metrics>, id: u64) {
        let mut builder = TableBuilder::new(config, id, 1, 1).unwrap();
        builder.add(tuple(b"k", id, b"v")).unwrap();
        builder.finish().unwrap();
        // Exercise the open path once so the files are known good.
        FileTable::open(config, id, Arc::clone(cache), Arc::clone(metrics)).unwrap();
    }

    #[test]
    fn test_recover_empty_directory() {
        let dir = TempDir::new().unwrap();
        let (config, cache, metrics) = harness(&dir);

        let recovered = recover(&config, &cache, &metrics).unwrap();
        assert!(recovered.tables.is_empty());
        assert_eq!(recovered.next_id, 1);
        assert_eq!(recovered.next_snapshot, 1);
    }

    #[test]
    fn test_recover_opens_published_tables() {
        let dir = TempDir::new().unwrap();
        let (config, cache, metrics) = harness(&dir);
        write_table(&config, &cache, &metrics, 3);
        write_table(&config, &cache, &metrics, 7);

        let recovered = recover(&config, &cache, &metrics).unwrap();
        let ids: Vec<u64> = recovered.tables.iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![3, 7]);
        assert_eq!(recovered.next_id, 8);
        assert_eq!(recovered.next_snapshot, 8);
    }

    #[test]
    fn test_recover_sweeps_partial_writes() {
        let dir = TempDir::new().unwrap();
        let (config, cache, metrics) = harness(&dir);
        fs::write(config.table_temp_path(5), b"partial").unwrap();
        fs::write(config.index_path(5), b"partial").unwrap();
        fs::write(config.filter_path(5), b"partial").unwrap();
        fs::write(config.index_path(6), b"orphan").unwrap();

        let recovered = recover(&config, &cache, &metrics).unwrap();
        assert!(recovered.tables.is_empty());
        assert!(!config.table_temp_path(5).exists());
        assert!(!config.index_path(5).exists());
        assert!(!config.filter_path(5).exists());
        assert!(!config.index_path(6).exists());
    }

    #[test]
    fn test_recover_rebuilds_table_from_wal() {
        let dir = TempDir::new().unwrap();
        let (config, cache, metrics) = harness(&dir);
        {
            let wal = Wal::create(&config.wal_path(4)).unwrap();
            wal.append(&tuple(b"a", 10, b"a10"), false).unwrap();
            wal.append(&tuple(b"b", 11, b"b11"), false).unwrap();
            wal.flush().unwrap();
        }

        let recovered = recover(&config, &cache, &metrics).unwrap();
        assert_eq!(recovered.tables.len(), 1);
        assert_eq!(recovered.tables[0].id(), 4);
        assert_eq!(recovered.next_id, 5);
        assert_eq!(recovered.next_snapshot, 12);
        assert!(!config.wal_path(4).exists());
        assert!(config.table_path(4).exists());

        let value = recovered.tables[0].get(b"a", u64::MAX).unwrap().unwrap();
        assert_eq!(value.value(), b"a10");
    }

    #[test]
    fn test_recover_deletes_empty_wal() {
        let dir = TempDir::new().unwrap();
        let (config, cache, metrics) = harness(&dir);
        {
            Wal::create(&config.wal_path(2)).unwrap();
        }

        let recovered = recover(&config, &cache, &metrics).unwrap();
        assert!(recovered.tables.is_empty());
        assert!(!config.wal_path(2).exists());
        // The id is still consumed so a new table cannot collide.
        assert_eq!(recovered.next_id, 3);
    }

    #[test]
    fn test_recover_drops_wal_behind_published_table() {
        let dir = TempDir::new().unwrap();
        let (config, cache, metrics) = harness(&dir);
        write_table(&config, &cache, &metrics, 9);
        {
            let wal = Wal::create(&config.wal_path(9)).unwrap();
            wal.append(&tuple(b"stale", 1, b"x"), false).unwrap();
            wal.flush().unwrap();
        }

        let recovered = recover(&config, &cache, &metrics).unwrap();
        assert_eq!(recovered.tables.len(), 1);
        assert!(!config.wal_path(9).exists());
        assert!(recovered.tables[0].get(b"stale", u64::MAX).unwrap().is_none());
    }
}
