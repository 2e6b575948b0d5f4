//! Error types for dup-archive.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from archive I/O.
///
/// Almost everything in this crate recovers locally (log, skip, continue);
/// these surface only from the hash cache and hashing helpers, whose
/// callers decide whether to degrade or propagate.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Hash cache CSV read/write error.
    #[error("hash cache CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Convenience constructor for [`ArchiveError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ArchiveError {
    ArchiveError::Io {
        path: path.into(),
        source,
    }
}
