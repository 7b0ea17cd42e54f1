//! # Error Types
//!
//! Most fallible paths in nvlog return `eyre::Result` with call-site context,
//! matching the storage-layer convention used throughout the crate. The typed
//! `WalError` enum exists for the handful of conditions that control flow must
//! distinguish:
//!
//! - `BufferFull` is an *expected* outcome of metadata-store page allocation.
//!   The writer path catches it, triggers a writeback, and retries; it never
//!   surfaces to callers.
//! - `Cancelled` marks work abandoned at a cooperative shutdown boundary.
//! - `ContractViolation` marks a caller breaking the writer protocol (posting
//!   epochs past the durable horizon, exhausting the frame ring).
//!
//! Everything else (`Io`, `MmapFailed`, `Corrupt`, `InvalidArgument`) is
//! terminal for the operation that produced it. Background threads stash the
//! first fatal error they see and exit their loop; `Wal::uninit` surfaces it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalError {
    /// Configuration pre-screening failed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An underlying read/write/open/stat/fsync failed.
    #[error("i/o error during {op}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A memory mapping could not be established.
    #[error("mmap failed: {0}")]
    MmapFailed(#[source] std::io::Error),

    /// The metadata-store write buffer holds a dirty page and cannot accept
    /// the next one. Expected; the caller writes back and retries.
    #[error("metadata buffer full, writeback required")]
    BufferFull,

    /// The writer protocol was violated (frame ring exhausted, which means
    /// the caller posted epochs more than two ahead of the durable horizon).
    #[error("writer contract violation: {0}")]
    ContractViolation(String),

    /// Work was abandoned because a cooperative stop was requested.
    #[error("operation cancelled by shutdown request")]
    Cancelled,

    /// Persistent state failed a structural check at init or recovery.
    #[error("corrupt persistent state: {0}")]
    Corrupt(String),
}

impl WalError {
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        WalError::Io { op, source }
    }
}
