pub mod cache;
pub mod compaction;
pub mod config;
pub mod error;
pub mod memory;
pub mod memtable;
pub mod merge;
pub mod metrics;
pub mod pool;
pub mod reader;
pub mod recovery;
pub mod sstable;
pub mod store;
pub mod tableset;
pub mod tuple;
pub mod wal;
pub mod writer;

pub use config::{CompactionStrategy, Config};
pub use error::{Error, Result};
pub use merge::Direction;
pub use metrics::MetricsSnapshot;
pub use store::Store;
pub use tuple::{Key, Snapshot, Tuple};
