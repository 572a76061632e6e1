//! Persistent table machinery: sorted blocks, bloom filter, B+tree
//! index, the table file itself, and the builder that streams tuples
//! into all of them.

pub mod block;
pub mod bloom;
pub mod builder;
pub mod index;
pub mod table;

pub use block::{SortedBlock, SortedBlockBuilder, SortedBlockIter};
pub use bloom::{BloomFilter, BloomFilterBuilder};
pub use builder::TableBuilder;
pub use index::{IndexReader, IndexWriter};
pub use table::{FileTable, FileTableIter, Trailer};
