//! Disk error types.

use thiserror::Error;

/// Result type for disk operations.
pub type DiskResult<T> = Result<T, DiskError>;

/// Outcome of a maintenance call (`flush`, `preallocate`,
/// `do_optimistic_io`): whether any work happened. Idle is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoProgress {
    Did,
    DidNothing,
}

/// Errors surfaced by the disk.
#[derive(Debug, Error)]
pub enum DiskError {
    /// The key has no value.
    #[error("not found")]
    NotFound,

    /// No disk exists for the requested region.
    #[error("no disk for region")]
    MissingDisk,

    /// The value's column count does not match the disk's arity.
    #[error("wrong arity")]
    WrongArity,

    /// The write-ahead queue is full; flush before retrying.
    #[error("write queue full")]
    DataFull,

    /// The search side is full; mandatory I/O is required.
    #[error("search log full")]
    SearchFull,

    /// Syncing the active segment failed.
    #[error("sync failed")]
    SyncFailed,

    /// Removing the disk's directory failed.
    #[error("drop failed")]
    DropFailed,

    /// Rotating the active segment failed.
    #[error("split failed")]
    SplitFailed,

    /// The disk has been quiesced and refuses writes.
    #[error("disk is quiesced read-only")]
    ReadOnly,

    /// On-disk state did not decode.
    #[error("corrupt disk state: {0}")]
    Corrupt(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
