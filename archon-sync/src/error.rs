//! Error types for archon-sync.

use std::path::PathBuf;

use thiserror::Error;

use archon_core::CoreError;

/// All errors that can arise from queue and emitter operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An error from the store, config or parser layer.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Request record could not be encoded.
    #[error("request JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A request file on disk is not a valid record. It has been moved to the
    /// dead-letter area.
    #[error("malformed request at {path}: {source}")]
    MalformedRequest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
