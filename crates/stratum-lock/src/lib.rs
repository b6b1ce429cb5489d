//! Inter-process segment lock protocol for Stratum.
//!
//! This crate provides:
//! - The shared lock word bit layout and its pure state transitions
//! - CAS loops applying those transitions against a mapped `AtomicU64`
//! - Thread-local reentrancy bookkeeping deciding which shared operation
//!   an acquire or release maps to

pub mod local;
pub mod shared;
pub mod word;

pub use local::{AcquireAction, LocalLockState, LockTotals, ReentrantLockState, ReleaseAction};
pub use shared::SegmentLock;

/// The three shared lock levels, ordered by permissiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// Shared with other readers and one update holder.
    Read,
    /// Exclusive against other update and write holders; readers may
    /// coexist.
    Update,
    /// Exclusive against everything.
    Write,
}

impl std::fmt::Display for LockLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockLevel::Read => write!(f, "read"),
            LockLevel::Update => write!(f, "update"),
            LockLevel::Write => write!(f, "write"),
        }
    }
}

/// Receives lock protocol failures that are recovered from rather than
/// surfaced: currently only acquisition timeouts, which reset the shared
/// word on the assumption that a holding process died.
pub trait ErrorListener: Send + Sync {
    /// Called when acquiring `level` on `segment` exceeded its budget.
    /// `word` is the lock word observed at expiry.
    fn on_lock_timeout(&self, segment: usize, level: LockLevel, word: u64);
}

/// Default listener: logs and carries on.
pub struct LoggingErrorListener;

impl ErrorListener for LoggingErrorListener {
    fn on_lock_timeout(&self, segment: usize, level: LockLevel, word: u64) {
        log::warn!(
            "lock timeout on segment {} acquiring {} lock (word {:#018x}); resetting",
            segment,
            level,
            word
        );
    }
}
