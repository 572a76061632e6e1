use std::sync::Arc;

use crate::error::Result;
use crate::merge::{Direction, LatestVersionIter, MergeIterator};
use crate::metrics::Metrics;
use crate::tableset::TableSet;
use crate::tuple::{Key, Snapshot, Tuple};

/// Read side of the store: point lookups across the live table set and
/// long-lived scans that survive table set churn.
pub struct TableReader {
    set: Arc<TableSet>,
    metrics: Arc<Metrics>,
}

impl TableReader {
    pub fn new(set: Arc<TableSet>, metrics: Arc<Metrics>) -> TableReader {
        TableReader { set, metrics }
    }

    /// Value of `raw` visible at `snapshot`, or `None` when absent or
    /// deleted. Probes tables newest first, skipping tables whose bloom
    /// filter rules the key out, and keeps the greatest visible version
    /// found anywhere.
    pub fn get(&self, raw: &[u8], snapshot: Snapshot) -> Result<Option<Vec<u8>>> {
        let ceiling = snapshot.id();
        let mut best: Option<Tuple> = None;
        for table in self.set.tables().iter().rev() {
            if !table.might_contain(raw) {
                self.metrics.bloom_skip();
                continue;
            }
            if let Some(tuple) = table.get(raw, ceiling)? {
                if best
                    .as_ref()
                    .map_or(true, |b| tuple.key().snapshot() > b.key().snapshot())
                {
                    best = Some(tuple);
                }
            }
        }
        Ok(best
            .filter(|tuple| !tuple.is_tombstone())
            .map(Tuple::into_value))
    }

    /// Ordered scan visible at `snapshot`, optionally starting from
    /// `from` (inclusive) in the scan direction.
    pub fn scan(
        &self,
        direction: Direction,
        snapshot: Snapshot,
        from: Option<&[u8]>,
    ) -> Result<ScanIterator> {
        // The initial bound spans every version of the from key.
        let origin = from.map(|raw| match direction {
            Direction::Ascending => Key::new(raw.to_vec(), 0),
            Direction::Descending => Key::new(raw.to_vec(), u64::MAX),
        });
        let bound_version = self.set.version();
        let resolved = bind(&self.set, direction, snapshot.id(), origin.as_ref())?;
        Ok(ScanIterator {
            set: Arc::clone(&self.set),
            direction,
            ceiling: snapshot.id(),
            resolved,
            bound_version,
            origin,
            last_raw: None,
            finished: false,
        })
    }
}

fn bind(
    set: &TableSet,
    direction: Direction,
    ceiling: u64,
    from: Option<&Key>,
) -> Result<LatestVersionIter<MergeIterator>> {
    let sources = set
        .tables()
        .iter()
        .map(|table| table.iter(direction, from))
        .collect::<Result<Vec<_>>>()?;
    Ok(LatestVersionIter::new(
        MergeIterator::new(sources, direction)?,
        ceiling,
    ))
}

/// Merged, version-resolved scan over the live table set.
///
/// The iterator captures the set's version counter when it binds its
/// sources. When the counter has moved (a flush or compaction changed
/// the set), the next step quietly rebinds against the current tables,
/// resuming strictly past the last raw key already returned. Snapshot
/// ids start at 1, so the resume bounds `(last, u64::MAX)` ascending
/// and `(last, 0)` descending can never collide with a real tuple.
pub struct ScanIterator {
    set: Arc<TableSet>,
    direction: Direction,
    ceiling: u64,
    resolved: LatestVersionIter<MergeIterator>,
    bound_version: u64,
    origin: Option<Key>,
    last_raw: Option<Vec<u8>>,
    finished: bool,
}

impl ScanIterator {
    fn rebind(&mut self) -> Result<()> {
        self.bound_version = self.set.version();
        let resume = match &self.last_raw {
            Some(raw) => Some(match self.direction {
                Direction::Ascending => Key::new(raw.clone(), u64::MAX),
                Direction::Descending => Key::new(raw.clone(), 0),
            }),
            None => self.origin.clone(),
        };
        self.resolved = bind(&self.set, self.direction, self.ceiling, resume.as_ref())?;
        tracing::debug!("scan rebound to current table set");
        Ok(())
    }
}

impl Iterator for ScanIterator {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.set.version() != self.bound_version {
            if let Err(e) = self.rebind() {
                self.finished = true;
                return Some(Err(e));
            }
        }
        loop {
            match self.resolved.next() {
                None => {
                    self.finished = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                Some(Ok(tuple)) => {
                    self.last_raw = Some(tuple.key().raw().to_vec());
                    // Deletions stay invisible but still advance the
                    // resume point.
                    if tuple.is_tombstone() {
                        continue;
                    }
                    return Some(Ok(tuple));
                }
            }
        }
    }
}
