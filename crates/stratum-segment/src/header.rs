//! Per-segment header accessors.
//!
//! The header occupies the first 64 bytes of every segment and is shared
//! by all threads and processes mapping the file:
//!
//! ```text
//! offset  size  field
//! ------  ----  -----
//!  0       8    lock word (see stratum-lock)
//!  8       8    entries (live entry count)
//! 16       8    deleted (cumulative removes since last clear)
//! 24       8    next_pos_to_search_from (allocator hint, chunk index)
//! 32       8    mod_count (structural modification counter)
//! 40      24    reserved
//! ```
//!
//! The lock word and `entries` are contended across processes and are only
//! touched through atomics. The remaining fields are written exclusively
//! under the segment update or write lock.

use crate::region::Region;
use std::sync::atomic::{AtomicU64, Ordering};

const LOCK_WORD_OFFSET: usize = 0;
const ENTRIES_OFFSET: usize = 8;
const DELETED_OFFSET: usize = 16;
const NEXT_POS_OFFSET: usize = 24;
const MOD_COUNT_OFFSET: usize = 32;

/// View over one segment's header fields.
#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    region: Region,
}

impl SegmentHeader {
    /// Creates a header view; `region` must start at the segment base.
    pub fn new(region: Region) -> Self {
        Self { region }
    }

    /// The shared lock word.
    pub fn lock_word(&self) -> &AtomicU64 {
        self.region.atomic_u64(LOCK_WORD_OFFSET)
    }

    /// Live entry count; acquire load so a counted entry is also visible.
    pub fn entries(&self) -> u64 {
        self.region.atomic_u64(ENTRIES_OFFSET).load(Ordering::Acquire)
    }

    /// Adjusts the live entry count. Caller holds the write lock.
    pub fn add_entries(&self, delta: i64) {
        let counter = self.region.atomic_u64(ENTRIES_OFFSET);
        let updated = counter
            .load(Ordering::Relaxed)
            .checked_add_signed(delta)
            .expect("entry count underflow");
        counter.store(updated, Ordering::Release);
    }

    /// Resets the live entry count. Caller holds the write lock.
    pub fn set_entries(&self, value: u64) {
        self.region
            .atomic_u64(ENTRIES_OFFSET)
            .store(value, Ordering::Release);
    }

    /// Cumulative removes since the last clear.
    pub fn deleted(&self) -> u64 {
        self.region.read_u64(DELETED_OFFSET)
    }

    /// Bumps the deleted counter. Caller holds the write lock.
    pub fn add_deleted(&self, delta: u64) {
        self.region
            .write_u64(DELETED_OFFSET, self.deleted() + delta);
    }

    /// Resets the deleted counter. Caller holds the write lock.
    pub fn set_deleted(&self, value: u64) {
        self.region.write_u64(DELETED_OFFSET, value);
    }

    /// Allocator search hint, a chunk index.
    pub fn next_pos_to_search_from(&self) -> usize {
        self.region.read_u64(NEXT_POS_OFFSET) as usize
    }

    /// Moves the allocator search hint. Caller holds the update lock.
    pub fn set_next_pos_to_search_from(&self, pos: usize) {
        self.region.write_u64(NEXT_POS_OFFSET, pos as u64);
    }

    /// Structural modification counter.
    pub fn mod_count(&self) -> u64 {
        self.region.read_u64(MOD_COUNT_OFFSET)
    }

    /// Bumps the modification counter. Caller holds the write lock.
    pub fn bump_mod_count(&self) {
        self.region
            .write_u64(MOD_COUNT_OFFSET, self.mod_count() + 1);
    }
}
