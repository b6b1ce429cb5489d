//! Error types for Stratum.

use thiserror::Error;

/// Result type alias using StratumError.
pub type Result<T> = std::result::Result<T, StratumError>;

/// Errors that can occur in Stratum operations.
///
/// Two failure kinds are deliberately *not* represented here: releasing a
/// lock whose reentrancy total is already zero, and exceeding the context
/// chain depth limit. Both indicate corrupted bookkeeping and terminate the
/// process via panic rather than surfacing a recoverable error.
#[derive(Debug, Error)]
pub enum StratumError {
    // I/O and file errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt map header: {reason}")]
    CorruptHeader { reason: String },

    #[error("configuration error: {0}")]
    ConfigError(String),

    // Allocation errors
    #[error("segment {segment} full, cannot store an entry of {chunks} chunks")]
    SegmentFull { segment: usize, chunks: usize },

    #[error("entry spans {chunks} chunks, max is {max}")]
    EntryTooLarge { chunks: usize, max: usize },

    // Lock protocol errors
    #[error("cannot upgrade from {from} lock to {to} lock")]
    IllegalUpgrade { from: String, to: String },

    #[error("lock acquisition on segment {segment} timed out after {nanos} ns")]
    LockTimeout { segment: usize, nanos: u64 },

    // Context errors
    #[error("context accessed from a thread other than its owner")]
    ConcurrentAccess,

    #[error("entry was removed during this iteration and may no longer be accessed")]
    StaleEntryAccess,

    #[error("nested context on segment {segment} is not supported")]
    NestedContext { segment: usize },

    #[error("key not found")]
    KeyNotFound,
}
