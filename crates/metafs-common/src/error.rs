//! Error types for MetaFS
//!
//! This module defines the common error types used throughout the system.

use thiserror::Error;

/// Common result type for MetaFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for MetaFS
///
/// Carried by value into completion callbacks that may fan out to several
/// waiters, so the whole enum is `Clone`; I/O errors are captured as their
/// rendered message.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    /// The backing object is gone. During replay this means another
    /// metadata server trimmed the journal ahead of our read position.
    #[error("object not found: {0}")]
    NotFound(String),

    /// This server has been fenced by the cluster and must not issue
    /// further writes.
    #[error("fenced by the cluster (blacklisted)")]
    Fenced,

    /// A cold start should be repeated from the top of `open`.
    #[error("try again: {0}")]
    TryAgain(String),

    #[error("corrupt log event at {pos} ({len} bytes)")]
    CorruptEvent { pos: u64, len: usize },

    #[error("journal pointer error: {0}")]
    Pointer(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid operation: {0}")]
    Invalid(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid-operation error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if the caller should retry the whole startup sequence
    #[must_use]
    pub fn is_try_again(&self) -> bool {
        matches!(self, Self::TryAgain(_))
    }

    /// Check if this error means the process has been fenced
    #[must_use]
    pub fn is_fenced(&self) -> bool {
        matches!(self, Self::Fenced)
    }
}
