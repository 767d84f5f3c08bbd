//! Error types for allocator operations.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by allocator components.
///
/// Caller misuse (bad groups, missing rights) is not an error: it is answered
/// with a `rejected` reply. What lands here is either the recoverable
/// [`AllocatorError::Invalid`] or a hard failure the caller has to deal with.
#[derive(Debug, Error)]
pub enum AllocatorError {
    /// The allocation (or a target it references) does not exist anymore.
    #[error("invalid allocation: {0}")]
    Invalid(String),
    /// A cross-process lock could not be taken in time.
    #[error("timed out after {waited:?} waiting for lock {}", path.display())]
    LockTimeout {
        /// Lock file that stayed busy.
        path: PathBuf,
        /// How long we waited.
        waited: Duration,
    },
    /// A persisted record could not be decoded.
    #[error("corrupt record {key}: {reason}")]
    Corrupt {
        /// Key of the record.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A key that cannot be stored (would escape its directory, empty...).
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// Configuration could not be loaded or is inconsistent.
    #[error("config error: {0}")]
    Config(String),
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding failure while persisting a value.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AllocatorError {
    /// True for the recoverable not-found case.
    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

/// Result type used by allocator operations.
pub type AllocResult<T> = Result<T, AllocatorError>;

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
