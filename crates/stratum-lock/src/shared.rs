//! CAS loops applying lock word transitions against shared memory.

use crate::word;
use crate::{ErrorListener, LockLevel};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use stratum_common::{Result, StratumError};

/// Pure CPU spins before the waiter starts yielding.
const SPIN_BEFORE_YIELD: u32 = 128;

/// Yields before the waiter registers itself and starts sleeping.
const YIELD_BEFORE_SLEEP: u32 = 64;

/// Sleep quantum once a waiter has registered.
const SLEEP_QUANTUM: Duration = Duration::from_micros(100);

/// Handle over one segment's shared lock word.
///
/// The word lives inside the mapped segment header, so every CAS issued
/// here is visible to all threads and processes sharing the file. The
/// handle itself carries no lock state; reentrancy bookkeeping is the
/// caller's job via [`crate::ReentrantLockState`].
pub struct SegmentLock<'a> {
    word: &'a AtomicU64,
    segment: usize,
}

impl<'a> SegmentLock<'a> {
    /// Creates a handle over a segment's lock word.
    pub fn new(word: &'a AtomicU64, segment: usize) -> Self {
        Self { word, segment }
    }

    /// Segment index this lock belongs to.
    pub fn segment(&self) -> usize {
        self.segment
    }

    /// Current raw word value.
    pub fn raw(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    /// Applies a fallible transition, retrying only on CAS contention.
    /// Returns false as soon as the precondition fails in the observed word.
    fn attempt(&self, transition: impl Fn(u64) -> Option<u64>) -> bool {
        let mut cur = self.word.load(Ordering::Relaxed);
        loop {
            let Some(next) = transition(cur) else {
                return false;
            };
            match self
                .word
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Applies an infallible transition.
    fn apply(&self, transition: impl Fn(u64) -> u64) {
        let mut cur = self.word.load(Ordering::Relaxed);
        loop {
            let next = transition(cur);
            match self
                .word
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Waits for a fallible transition to succeed, up to `timeout`.
    ///
    /// Backoff escalates from busy spins to yields to sleeps; once the
    /// waiter starts sleeping it registers itself in the word's waiter
    /// field so contention is observable from other processes.
    fn acquire_for(&self, timeout: Duration, transition: impl Fn(u64) -> Option<u64>) -> bool {
        let deadline = Instant::now() + timeout;
        let mut rounds: u32 = 0;
        let mut registered = false;
        loop {
            if self.attempt(&transition) {
                if registered {
                    self.word.fetch_sub(word::WAIT_ONE, Ordering::AcqRel);
                }
                return true;
            }
            if Instant::now() >= deadline {
                if registered {
                    self.word.fetch_sub(word::WAIT_ONE, Ordering::AcqRel);
                }
                return false;
            }
            rounds += 1;
            if rounds < SPIN_BEFORE_YIELD {
                std::hint::spin_loop();
            } else if rounds < SPIN_BEFORE_YIELD + YIELD_BEFORE_SLEEP {
                std::thread::yield_now();
            } else {
                if !registered {
                    self.word.fetch_add(word::WAIT_ONE, Ordering::AcqRel);
                    registered = true;
                }
                std::thread::sleep(SLEEP_QUANTUM);
            }
        }
    }

    // --- try variants: no waiting ---

    /// Attempts a read lock without waiting.
    pub fn try_read_lock(&self) -> bool {
        self.attempt(word::try_read)
    }

    /// Attempts the update lock without waiting.
    pub fn try_update_lock(&self) -> bool {
        self.attempt(word::try_update)
    }

    /// Attempts the write lock without waiting.
    pub fn try_write_lock(&self) -> bool {
        self.attempt(word::try_write)
    }

    /// Attempts the update-to-write upgrade without waiting for readers.
    pub fn try_upgrade_update_to_write(&self) -> bool {
        self.attempt(word::try_upgrade_update_to_write)
    }

    // --- timed variants: wait up to `timeout`, no side effect on expiry ---

    /// Waits up to `timeout` for a read lock.
    pub fn read_lock_for(&self, timeout: Duration) -> bool {
        self.acquire_for(timeout, word::try_read)
    }

    /// Waits up to `timeout` for the update lock.
    pub fn update_lock_for(&self, timeout: Duration) -> bool {
        self.acquire_for(timeout, word::try_update)
    }

    /// Waits up to `timeout` for the write lock.
    pub fn write_lock_for(&self, timeout: Duration) -> bool {
        self.acquire_for(timeout, word::try_write)
    }

    /// Waits up to `timeout` for the readers to drain and upgrades a held
    /// update lock to write.
    pub fn upgrade_update_to_write_for(&self, timeout: Duration) -> bool {
        self.acquire_for(timeout, word::try_upgrade_update_to_write)
    }

    // --- blocking variants with timeout recovery ---

    /// Acquires `level`, waiting up to `timeout`.
    ///
    /// On expiry the failure is reported to `listener`, the lock word is
    /// reset best-effort (a holder crashed mid-operation is the expected
    /// cause), and the acquire is retried once. A second expiry surfaces
    /// [`StratumError::LockTimeout`].
    pub fn lock(
        &self,
        level: LockLevel,
        timeout: Duration,
        listener: &dyn ErrorListener,
    ) -> Result<()> {
        let acquired = match level {
            LockLevel::Read => self.read_lock_for(timeout),
            LockLevel::Update => self.update_lock_for(timeout),
            LockLevel::Write => self.write_lock_for(timeout),
        };
        if acquired {
            return Ok(());
        }
        self.recover_and_retry(level, timeout, listener, |lock| match level {
            LockLevel::Read => lock.read_lock_for(timeout),
            LockLevel::Update => lock.update_lock_for(timeout),
            LockLevel::Write => lock.write_lock_for(timeout),
        })
    }

    /// Upgrades a held update lock to write, waiting up to `timeout` for
    /// readers to drain, with the same recovery policy as [`Self::lock`].
    ///
    /// After a reset the update lock this thread held is gone, so the
    /// retry acquires the write lock from scratch.
    pub fn upgrade_update_to_write(
        &self,
        timeout: Duration,
        listener: &dyn ErrorListener,
    ) -> Result<()> {
        if self.upgrade_update_to_write_for(timeout) {
            return Ok(());
        }
        self.recover_and_retry(LockLevel::Write, timeout, listener, |lock| {
            lock.write_lock_for(timeout)
        })
    }

    fn recover_and_retry(
        &self,
        level: LockLevel,
        timeout: Duration,
        listener: &dyn ErrorListener,
        retry: impl Fn(&Self) -> bool,
    ) -> Result<()> {
        listener.on_lock_timeout(self.segment, level, self.raw());
        self.reset();
        if retry(self) {
            Ok(())
        } else {
            Err(StratumError::LockTimeout {
                segment: self.segment,
                nanos: timeout.as_nanos() as u64,
            })
        }
    }

    /// Forces the lock word back to the unlocked state, preserving the
    /// waiter count. Best-effort recovery after a holder died; any state
    /// a live holder had is lost.
    pub fn reset(&self) {
        self.apply(|w| w & !(word::READER_MASK | word::UPDATE_BIT | word::WRITE_BIT));
    }

    // --- downgrades and unlocks: caller must hold the named level ---

    /// Downgrades a held write lock to update.
    pub fn downgrade_write_to_update(&self) {
        self.apply(word::downgrade_write_to_update);
    }

    /// Downgrades a held update lock to a read lock.
    pub fn downgrade_update_to_read(&self) {
        self.apply(word::downgrade_update_to_read);
    }

    /// Downgrades a held write lock to a read lock.
    pub fn downgrade_write_to_read(&self) {
        self.apply(word::downgrade_write_to_read);
    }

    /// Releases one read lock.
    pub fn read_unlock(&self) {
        self.apply(word::read_unlock);
    }

    /// Releases the update lock.
    pub fn update_unlock(&self) {
        self.apply(word::update_unlock);
    }

    /// Releases the write lock.
    pub fn write_unlock(&self) {
        self.apply(word::write_unlock);
    }
}
