//! Error types for archon-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from store, config and artifact operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A store record could not be encoded or decoded.
    #[error("record JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Config YAML parse error, with the offending file.
    #[error("failed to parse config at {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Directory name is not `<ordinal>-<kebab-case-name>`.
    #[error("'{0}' is not a feature identifier (expected <ordinal>-<kebab-case-name>)")]
    InvalidFeature(String),

    /// Feature directory does not exist.
    #[error("feature directory not found: {path}")]
    FeatureNotFound { path: PathBuf },
}

/// Convenience constructor for [`CoreError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn json_err(path: impl Into<PathBuf>, source: serde_json::Error) -> CoreError {
    CoreError::Json {
        path: path.into(),
        source,
    }
}
