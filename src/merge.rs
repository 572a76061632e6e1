use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::tuple::Tuple;

/// Iteration direction for scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    /// Order `a` relative to `b` in this direction.
    fn cmp_tuples(self, a: &Tuple, b: &Tuple) -> Ordering {
        match self {
            Direction::Ascending => a.key().cmp(b.key()),
            Direction::Descending => b.key().cmp(a.key()),
        }
    }
}

/// Boxed source of tuples, already sorted in the scan direction.
pub type TupleIter = Box<dyn Iterator<Item = Result<Tuple>> + Send>;

struct HeapEntry {
    tuple: Tuple,
    /// Position in the source list; newer sources sort first on key
    /// ties so merge output is deterministic.
    source: usize,
    direction: Direction,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest key in the
        // scan direction surfaces first.
        match self.direction.cmp_tuples(&self.tuple, &other.tuple) {
            Ordering::Equal => self.source.cmp(&other.source).reverse(),
            ordering => ordering.reverse(),
        }
    }
}

/// K-way merge over sorted tuple sources.
///
/// Emits every tuple from every source in key order for the scan
/// direction. Versions are not collapsed here; [`LatestVersionIter`]
/// layers snapshot resolution on top.
pub struct MergeIterator {
    heap: BinaryHeap<HeapEntry>,
    sources: Vec<TupleIter>,
    direction: Direction,
    failed: bool,
}

impl MergeIterator {
    pub fn new(sources: Vec<TupleIter>, direction: Direction) -> Result<Self> {
        let mut merge = MergeIterator {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            direction,
            failed: false,
        };
        for source in 0..merge.sources.len() {
            merge.advance(source)?;
        }
        Ok(merge)
    }

    /// Pull the next tuple from `source` onto the heap.
    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(item) = self.sources[source].next() {
            self.heap.push(HeapEntry {
                tuple: item?,
                source,
                direction: self.direction,
            });
        }
        Ok(())
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let entry = self.heap.pop()?;
        if let Err(e) = self.advance(entry.source) {
            self.failed = true;
            return Some(Err(e));
        }
        Some(Ok(entry.tuple))
    }
}

/// Collapses each run of same-raw-key tuples to the version visible at
/// `ceiling`: the greatest snapshot id not above it. Runs with no
/// visible version are skipped entirely. Tombstone winners are emitted;
/// filtering them is the caller's concern.
pub struct LatestVersionIter<I> {
    inner: I,
    ceiling: u64,
    pending: Option<Tuple>,
    done: bool,
}

impl<I> LatestVersionIter<I>
where
    I: Iterator<Item = Result<Tuple>>,
{
    pub fn new(inner: I, ceiling: u64) -> Self {
        Self {
            inner,
            ceiling,
            pending: None,
            done: false,
        }
    }

    fn pull(&mut self) -> Option<Result<Tuple>> {
        if let Some(tuple) = self.pending.take() {
            return Some(Ok(tuple));
        }
        self.inner.next()
    }
}

impl<I> Iterator for LatestVersionIter<I>
where
    I: Iterator<Item = Result<Tuple>>,
{
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let first = match self.pull()? {
                Ok(tuple) => tuple,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let raw = first.key().raw().to_vec();
            let mut winner =
                (first.key().snapshot() <= self.ceiling).then_some(first);

            // Consume the rest of this raw key's run.
            loop {
                match self.inner.next() {
                    None => break,
                    Some(Err(e)) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                    Some(Ok(tuple)) => {
                        if tuple.key().raw() != raw.as_slice() {
                            self.pending = Some(tuple);
                            break;
                        }
                        if tuple.key().snapshot() <= self.ceiling
                            && winner
                                .as_ref()
                                .map_or(true, |w| tuple.key().snapshot() > w.key().snapshot())
                        {
                            winner = Some(tuple);
                        }
                    }
                }
            }

            if let Some(winner) = winner {
                return Some(Ok(winner));
            }
            // No version of this key visible at the ceiling; next run.
        }
    }
}
