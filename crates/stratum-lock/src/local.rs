//! Thread-local lock state and reentrancy bookkeeping.
//!
//! A context touches the shared lock word at most once: the first acquire
//! on a thread goes to shared memory, and every further acquire through the
//! same context only moves counters here. The decision of *which* shared
//! operation (if any) an acquire or release maps to is computed by pure
//! functions on this state, so the protocol is testable without a mapping.

use crate::LockLevel;
use stratum_common::{Result, StratumError};

/// Lock level a context holds locally, ordered by permissiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LocalLockState {
    /// No lock held.
    Unlocked,
    /// Holds a read lock.
    ReadLocked,
    /// Holds the update lock (readers may coexist).
    UpdateLocked,
    /// Holds the write lock (exclusive).
    WriteLocked,
}

impl LocalLockState {
    /// State reached by acquiring `level`.
    fn of(level: LockLevel) -> Self {
        match level {
            LockLevel::Read => LocalLockState::ReadLocked,
            LockLevel::Update => LocalLockState::UpdateLocked,
            LockLevel::Write => LocalLockState::WriteLocked,
        }
    }
}

/// Reentrant hold counts per level for one context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockTotals {
    /// Outstanding read acquisitions.
    pub read: u32,
    /// Outstanding update acquisitions.
    pub update: u32,
    /// Outstanding write acquisitions.
    pub write: u32,
}

/// Shared-word operation an acquire maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireAction {
    /// Already covered by the current hold; only counters move.
    None,
    /// First acquire: take a read lock on the shared word.
    AcquireRead,
    /// First acquire: take the update lock on the shared word.
    AcquireUpdate,
    /// First acquire: take the write lock on the shared word.
    AcquireWrite,
    /// Update held, write requested: upgrade on the shared word.
    UpgradeUpdateToWrite,
}

/// Shared-word operation a release maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    /// Other holds remain; only counters move.
    None,
    /// Last hold released from the read level.
    ReadUnlock,
    /// Last hold released from the update level.
    UpdateUnlock,
    /// Last hold released from the write level.
    WriteUnlock,
    /// Write released with update holds outstanding.
    DowngradeWriteToUpdate,
    /// Write released with only read holds outstanding.
    DowngradeWriteToRead,
    /// Update released with only read holds outstanding.
    DowngradeUpdateToRead,
}

/// Per-context reentrant lock state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReentrantLockState {
    state: LocalLockState,
    totals: LockTotals,
}

impl Default for LocalLockState {
    fn default() -> Self {
        LocalLockState::Unlocked
    }
}

impl ReentrantLockState {
    /// Fresh, unlocked state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current local lock level.
    pub fn state(&self) -> LocalLockState {
        self.state
    }

    /// Current hold counts.
    pub fn totals(&self) -> LockTotals {
        self.totals
    }

    /// True if the context holds at least `level`.
    pub fn holds(&self, level: LockLevel) -> bool {
        self.state >= LocalLockState::of(level)
    }

    /// Computes the shared-word operation acquiring `level` requires.
    ///
    /// Upgrading from a read hold is forbidden: the read lock must be fully
    /// released before an update or write acquire, otherwise two readers
    /// upgrading against each other would deadlock.
    pub fn plan_acquire(&self, level: LockLevel) -> Result<AcquireAction> {
        match (self.state, level) {
            (LocalLockState::Unlocked, LockLevel::Read) => Ok(AcquireAction::AcquireRead),
            (LocalLockState::Unlocked, LockLevel::Update) => Ok(AcquireAction::AcquireUpdate),
            (LocalLockState::Unlocked, LockLevel::Write) => Ok(AcquireAction::AcquireWrite),
            (LocalLockState::ReadLocked, LockLevel::Read) => Ok(AcquireAction::None),
            (LocalLockState::ReadLocked, to) => Err(StratumError::IllegalUpgrade {
                from: "read".to_string(),
                to: to.to_string(),
            }),
            (LocalLockState::UpdateLocked, LockLevel::Write) => {
                Ok(AcquireAction::UpgradeUpdateToWrite)
            }
            (LocalLockState::UpdateLocked, _) => Ok(AcquireAction::None),
            (LocalLockState::WriteLocked, _) => Ok(AcquireAction::None),
        }
    }

    /// Records a successful acquire of `level`.
    ///
    /// Call only after the action returned by [`Self::plan_acquire`] has
    /// been applied to the shared word (or was [`AcquireAction::None`]).
    pub fn commit_acquire(&mut self, level: LockLevel) {
        match level {
            LockLevel::Read => self.totals.read += 1,
            LockLevel::Update => self.totals.update += 1,
            LockLevel::Write => self.totals.write += 1,
        }
        self.state = self.state.max(LocalLockState::of(level));
    }

    /// Releases one hold of `level`, returning the shared-word operation
    /// the release maps to. Counters and local state are updated here; the
    /// caller applies the returned action to the shared word.
    ///
    /// # Panics
    ///
    /// Panics when `level` has no outstanding hold. An unmatched release
    /// means the caller's pairing is broken and the shared word can no
    /// longer be trusted.
    pub fn release(&mut self, level: LockLevel) -> ReleaseAction {
        match level {
            LockLevel::Write => {
                self.check_underflow(self.totals.write, level);
                self.totals.write -= 1;
                if self.totals.write > 0 {
                    return ReleaseAction::None;
                }
                if self.totals.update > 0 {
                    self.state = LocalLockState::UpdateLocked;
                    ReleaseAction::DowngradeWriteToUpdate
                } else if self.totals.read > 0 {
                    self.state = LocalLockState::ReadLocked;
                    ReleaseAction::DowngradeWriteToRead
                } else {
                    self.state = LocalLockState::Unlocked;
                    ReleaseAction::WriteUnlock
                }
            }
            LockLevel::Update => {
                self.check_underflow(self.totals.update, level);
                self.totals.update -= 1;
                if self.totals.update > 0 || self.totals.write > 0 {
                    return ReleaseAction::None;
                }
                if self.totals.read > 0 {
                    self.state = LocalLockState::ReadLocked;
                    ReleaseAction::DowngradeUpdateToRead
                } else {
                    self.state = LocalLockState::Unlocked;
                    ReleaseAction::UpdateUnlock
                }
            }
            LockLevel::Read => {
                self.check_underflow(self.totals.read, level);
                self.totals.read -= 1;
                if self.totals.read > 0 || self.totals.update > 0 || self.totals.write > 0 {
                    return ReleaseAction::None;
                }
                self.state = LocalLockState::Unlocked;
                ReleaseAction::ReadUnlock
            }
        }
    }

    /// Drains every outstanding hold, returning the shared-word operations
    /// to apply in order. Used when closing a context from whatever level
    /// it ended at.
    pub fn release_all(&mut self) -> Vec<ReleaseAction> {
        let mut actions = Vec::new();
        while self.totals.write > 0 {
            actions.push(self.release(LockLevel::Write));
        }
        while self.totals.update > 0 {
            actions.push(self.release(LockLevel::Update));
        }
        while self.totals.read > 0 {
            actions.push(self.release(LockLevel::Read));
        }
        debug_assert_eq!(self.state, LocalLockState::Unlocked);
        actions
    }

    fn check_underflow(&self, total: u32, level: LockLevel) {
        if total == 0 {
            panic!(
                "LockUnderflow: releasing {} lock with zero outstanding holds \
                 (state {:?}, totals {:?})",
                level, self.state, self.totals
            );
        }
    }
}
