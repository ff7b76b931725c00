//! Error types for collector refreshes.
//!
//! Every refresh task settles with `Result<T, CollectError>`. Cancellation is a
//! normal outcome and is reported as `CollectError::Cancelled` so callers can
//! skip logging it.

use std::path::PathBuf;
use thiserror::Error;

/// Reasons a refresh did not produce a value.
#[derive(Debug, Error)]
pub enum CollectError {
    /// The run was superseded by a newer one or the collector stopped.
    #[error("refresh cancelled")]
    Cancelled,

    /// A kernel pseudo-file could not be read this tick.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file was read but did not have the expected shape.
    #[error("malformed data in {}: {detail}", path.display())]
    Malformed { path: PathBuf, detail: String },

    /// An external helper process failed or produced unusable output.
    #[error("helper failed: {0}")]
    Helper(String),

    /// The refresh task panicked or was aborted by the runtime.
    #[error("refresh task failed: {0}")]
    Task(String),
}

impl CollectError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CollectError::Cancelled)
    }

    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CollectError::Read {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        CollectError::Malformed {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

pub type CollectResult<T> = Result<T, CollectError>;
