use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
///
/// I/O failures bubble up to the caller untouched. Corruption detected
/// while decoding on-disk structures carries the structure name so the
/// failing file can be identified from the error alone.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to decode {0}: {1}")]
    Decode(&'static str, #[source] io::Error),

    #[error("corrupt {structure}: {detail}")]
    Corrupt {
        structure: &'static str,
        detail: String,
    },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("store is closed")]
    Closed,

    #[error("{0} pool did not drain within shutdown timeout")]
    ShutdownTimeout(&'static str),
}

impl Error {
    pub(crate) fn corrupt(structure: &'static str, detail: impl Into<String>) -> Self {
        Error::Corrupt {
            structure,
            detail: detail.into(),
        }
    }
}
