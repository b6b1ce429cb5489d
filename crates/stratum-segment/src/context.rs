//! Segment access context: locking, point lookups, and the scan protocol.
//!
//! A context pairs one thread with one segment. It carries the thread's
//! reentrant lock state, the iteration cursor, and the parsed form of the
//! entry under the cursor. All mutation of a segment funnels through a
//! context, which is what lets the lock protocol and the cursor state stay
//! coherent while predicates replace and remove entries mid-scan.
//!
//! Contexts are registered in the per-thread [`crate::chain`] so a second
//! context on the same (thread, segment) is refused up front, and every
//! public operation re-checks that the calling thread is the owner.

use crate::chain::ChainGuard;
use crate::entry::ParsedEntry;
use crate::segment::Segment;
use bytes::Bytes;
use std::thread::ThreadId;
use std::time::Duration;
use stratum_common::{Result, StratumError};
use stratum_lock::{
    AcquireAction, ErrorListener, LocalLockState, LockLevel, ReentrantLockState, ReleaseAction,
    SegmentLock,
};

/// A thread's session on one segment.
pub struct SegmentContext<'a> {
    pub(crate) segment: Segment<'a>,
    pub(crate) lock: ReentrantLockState,
    pub(crate) owner: ThreadId,
    pub(crate) timeout: Duration,
    pub(crate) listener: &'a dyn ErrorListener,
    _chain: ChainGuard,

    /// Scan cursor / last probed slot, a byte position in the hash table.
    pub(crate) hash_lookup_pos: Option<usize>,
    /// Parsed entry under the cursor.
    pub(crate) entry: Option<ParsedEntry>,
    /// Set when the current entry was removed through the view; any later
    /// access through the view fails.
    pub(crate) entry_removed: bool,
}

impl<'a> SegmentContext<'a> {
    /// Opens a context for `segment`, registering it in this thread's
    /// context chain.
    pub fn new(
        segment: Segment<'a>,
        map_id: u64,
        timeout: Duration,
        listener: &'a dyn ErrorListener,
    ) -> Result<Self> {
        let chain = ChainGuard::enter(map_id, segment.index())?;
        Ok(Self {
            segment,
            lock: ReentrantLockState::new(),
            owner: std::thread::current().id(),
            timeout,
            listener,
            _chain: chain,
            hash_lookup_pos: None,
            entry: None,
            entry_removed: false,
        })
    }

    /// The segment this context is bound to.
    pub fn segment(&self) -> &Segment<'a> {
        &self.segment
    }

    /// Local lock level this context holds.
    pub fn local_lock_state(&self) -> LocalLockState {
        self.lock.state()
    }

    pub(crate) fn check_owner(&self) -> Result<()> {
        if std::thread::current().id() != self.owner {
            return Err(StratumError::ConcurrentAccess);
        }
        Ok(())
    }

    /// Owner and liveness assertions run by every public view operation.
    pub(crate) fn check_on_each_public_operation(&self) -> Result<()> {
        self.check_owner()?;
        if self.entry_removed {
            return Err(StratumError::StaleEntryAccess);
        }
        Ok(())
    }

    fn shared(&self) -> SegmentLock<'_> {
        SegmentLock::new(self.segment.lock_word(), self.segment.index())
    }

    /// Acquires `level`, blocking up to the configured timeout when the
    /// shared word must be taken or upgraded.
    pub fn acquire(&mut self, level: LockLevel) -> Result<()> {
        self.check_owner()?;
        let action = self.lock.plan_acquire(level)?;
        match action {
            AcquireAction::None => {}
            AcquireAction::AcquireRead => {
                self.shared().lock(LockLevel::Read, self.timeout, self.listener)?
            }
            AcquireAction::AcquireUpdate => {
                self.shared()
                    .lock(LockLevel::Update, self.timeout, self.listener)?
            }
            AcquireAction::AcquireWrite => {
                self.shared()
                    .lock(LockLevel::Write, self.timeout, self.listener)?
            }
            AcquireAction::UpgradeUpdateToWrite => self
                .shared()
                .upgrade_update_to_write(self.timeout, self.listener)?,
        }
        self.lock.commit_acquire(level);
        Ok(())
    }

    /// Attempts `level` without waiting. A forbidden read upgrade still
    /// surfaces as an error rather than `false`.
    pub fn try_acquire(&mut self, level: LockLevel) -> Result<bool> {
        self.check_owner()?;
        let action = self.lock.plan_acquire(level)?;
        let acquired = match action {
            AcquireAction::None => true,
            AcquireAction::AcquireRead => self.shared().try_read_lock(),
            AcquireAction::AcquireUpdate => self.shared().try_update_lock(),
            AcquireAction::AcquireWrite => self.shared().try_write_lock(),
            AcquireAction::UpgradeUpdateToWrite => self.shared().try_upgrade_update_to_write(),
        };
        if acquired {
            self.lock.commit_acquire(level);
        }
        Ok(acquired)
    }

    /// Releases one hold of `level`, downgrading or releasing the shared
    /// word when this was the last hold backing it.
    pub fn release(&mut self, level: LockLevel) {
        let action = self.lock.release(level);
        self.apply_release(action);
    }

    fn apply_release(&self, action: ReleaseAction) {
        let shared = self.shared();
        match action {
            ReleaseAction::None => {}
            ReleaseAction::ReadUnlock => shared.read_unlock(),
            ReleaseAction::UpdateUnlock => shared.update_unlock(),
            ReleaseAction::WriteUnlock => shared.write_unlock(),
            ReleaseAction::DowngradeWriteToUpdate => shared.downgrade_write_to_update(),
            ReleaseAction::DowngradeWriteToRead => shared.downgrade_write_to_read(),
            ReleaseAction::DowngradeUpdateToRead => shared.downgrade_update_to_read(),
        }
    }

    /// Acquires a read lock.
    pub fn read_lock(&mut self) -> Result<()> {
        self.acquire(LockLevel::Read)
    }

    /// Acquires the update lock.
    pub fn update_lock(&mut self) -> Result<()> {
        self.acquire(LockLevel::Update)
    }

    /// Acquires the write lock, upgrading a held update lock.
    pub fn write_lock(&mut self) -> Result<()> {
        self.acquire(LockLevel::Write)
    }

    /// Drops the cursor and cached entry state.
    pub(crate) fn clear_cached(&mut self) {
        self.hash_lookup_pos = None;
        self.entry = None;
        self.entry_removed = false;
    }

    /// Walks every live entry of the segment under the update lock,
    /// invoking `predicate` with a view that supports `replace_value` and
    /// `remove`. Returns `Ok(true)` when the scan visited everything and
    /// `Ok(false)` when the predicate stopped it early; mutations made
    /// before an early stop stand.
    pub fn for_each_remaining<F>(&mut self, mut predicate: F) -> Result<bool>
    where
        F: FnMut(&mut EntryView<'_, 'a>) -> Result<bool>,
    {
        self.check_owner()?;
        self.acquire(LockLevel::Update)?;
        let completed = self.scan(&mut predicate);
        self.clear_cached();
        self.release(LockLevel::Update);
        completed
    }

    /// Read-only convenience over [`Self::for_each_remaining`].
    pub fn for_each<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        self.for_each_remaining(|view| {
            f(view.key()?, view.value()?);
            Ok(true)
        })
        .map(|_| ())
    }

    fn scan<F>(&mut self, predicate: &mut F) -> Result<bool>
    where
        F: FnMut(&mut EntryView<'_, 'a>) -> Result<bool>,
    {
        let mut remaining = self.segment.header().entries();
        if remaining == 0 {
            return Ok(true);
        }
        let table = self.segment.hash_lookup();

        // Start at an empty slot so no probe run wraps across the scan
        // boundary; one always exists because inserts cap live entries
        // one below the table capacity.
        let mut start = 0;
        while table.read_slot(start) != 0 {
            start = table.step(start);
        }

        let mut cursor = start;
        loop {
            cursor = table.step(cursor);
            if cursor == start {
                return Ok(true);
            }
            self.hash_lookup_pos = Some(cursor);
            let slot = table.read_slot(cursor);
            if slot != 0 {
                let parsed = self.segment.codec().parse(table.slot_value(slot));
                self.entry = Some(parsed);
                self.entry_removed = false;
                let keep_going = predicate(&mut EntryView { ctx: self })?;
                self.entry = None;
                if !keep_going {
                    return Ok(false);
                }
                remaining -= 1;
                if remaining == 0 {
                    return Ok(true);
                }
            }
            // A remove may have stepped the cursor back so the slot that
            // shifted into the cleared position gets visited.
            cursor = self.hash_lookup_pos.expect("cursor lost during scan");
        }
    }
}

impl Drop for SegmentContext<'_> {
    fn drop(&mut self) {
        // Close from whatever level the context ended at down to unlocked.
        for action in self.lock.release_all() {
            self.apply_release(action);
        }
    }
}

/// The entry under a scan cursor, exposed to predicates.
pub struct EntryView<'c, 'a> {
    pub(crate) ctx: &'c mut SegmentContext<'a>,
}

impl<'a> EntryView<'_, 'a> {
    fn parsed(&self) -> ParsedEntry {
        self.ctx.entry.expect("view without a parsed entry")
    }

    /// The entry's key, borrowed from the mapping.
    pub fn key(&self) -> Result<&[u8]> {
        self.ctx.check_on_each_public_operation()?;
        let entry = self.parsed();
        Ok(self.ctx.segment.entry_key_bytes(&entry))
    }

    /// The entry's value, borrowed from the mapping.
    pub fn value(&self) -> Result<&[u8]> {
        self.ctx.check_on_each_public_operation()?;
        let entry = self.parsed();
        Ok(self.ctx.segment.entry_value_bytes(&entry))
    }

    /// Owned copy of the value.
    pub fn value_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.value()?))
    }

    /// Replaces the entry's value, in place when the new value fits the
    /// current chunk run (or can grow it), relocating otherwise.
    pub fn replace_value(&mut self, new_value: &[u8]) -> Result<()> {
        self.ctx.check_on_each_public_operation()?;
        self.ctx.acquire(LockLevel::Write)?;
        let result = self.ctx.replace_value_cached(new_value);
        self.ctx.release(LockLevel::Write);
        result
    }

    /// Removes the entry. The view refuses any further access afterwards.
    pub fn remove(&mut self) -> Result<()> {
        self.ctx.check_on_each_public_operation()?;
        self.ctx.acquire(LockLevel::Write)?;
        self.ctx.remove_cached();
        self.ctx.release(LockLevel::Write);
        Ok(())
    }

    /// Acquires a read lock through the owning context.
    pub fn read_lock(&mut self) -> Result<()> {
        self.ctx.acquire(LockLevel::Read)
    }

    /// Acquires the update lock through the owning context.
    pub fn update_lock(&mut self) -> Result<()> {
        self.ctx.acquire(LockLevel::Update)
    }

    /// Acquires the write lock through the owning context.
    pub fn write_lock(&mut self) -> Result<()> {
        self.ctx.acquire(LockLevel::Write)
    }
}
