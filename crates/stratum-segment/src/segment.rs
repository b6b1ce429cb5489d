//! Segment wiring and point operations.
//!
//! [`Segment`] bundles the views over one segment's regions (header, hash
//! lookup, free list, entry space). The point operations — put, get,
//! remove, replace, contains, clear — live on [`SegmentContext`] so they
//! share the lock protocol and cached-entry state with the scan API.

use crate::context::SegmentContext;
use crate::entry::{EntryCodec, ParsedEntry};
use crate::freelist::FreeList;
use crate::hashlookup::HashLookup;
use crate::header::SegmentHeader;
use crate::region::Region;
use bytes::Bytes;
use std::sync::atomic::AtomicU64;
use stratum_common::{Result, SegmentLayout, StratumError};
use stratum_lock::LockLevel;

/// One independently lockable shard of the map.
#[derive(Clone, Copy)]
pub struct Segment<'a> {
    index: usize,
    layout: &'a SegmentLayout,
    region: Region,
}

impl<'a> Segment<'a> {
    /// Creates a segment over `region`, which must start at the segment
    /// base and span at least `layout.segment_size` bytes.
    pub fn new(region: Region, layout: &'a SegmentLayout, index: usize) -> Self {
        debug_assert!(region.len() >= layout.segment_size);
        Self {
            index,
            layout,
            region,
        }
    }

    /// Index of this segment within the map.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Shared layout of every segment in the map.
    pub fn layout(&self) -> &'a SegmentLayout {
        self.layout
    }

    /// The segment's header fields.
    pub fn header(&self) -> SegmentHeader {
        SegmentHeader::new(self.region)
    }

    /// The shared lock word in the segment header.
    pub fn lock_word(&self) -> &AtomicU64 {
        self.region.atomic_u64(0)
    }

    /// The segment's chunk allocator.
    pub fn freelist(&self) -> FreeList<'a> {
        FreeList::new(self.region, self.layout, self.index)
    }

    /// The segment's hash lookup table.
    pub fn hash_lookup(&self) -> HashLookup<'a> {
        HashLookup::new(self.region, self.layout)
    }

    /// The segment's entry codec.
    pub fn codec(&self) -> EntryCodec<'a> {
        EntryCodec::new(self.region, self.layout)
    }

    /// Live entry count.
    pub fn size(&self) -> u64 {
        self.header().entries()
    }

    /// Borrows an entry's key bytes from the mapping.
    pub fn entry_key_bytes(&self, entry: &ParsedEntry) -> &[u8] {
        self.region.bytes(entry.key_offset, entry.key_size)
    }

    /// Borrows an entry's value bytes from the mapping.
    pub fn entry_value_bytes(&self, entry: &ParsedEntry) -> &[u8] {
        self.region.bytes(entry.value_offset, entry.value_size)
    }
}

impl SegmentContext<'_> {
    /// Live entry count of the segment; lock-free.
    pub fn size(&self) -> u64 {
        self.segment.size()
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn put(&mut self, hash: u64, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        self.acquire(LockLevel::Update)?;
        let result = self.put_locked(hash, key, value);
        self.clear_cached();
        self.release(LockLevel::Update);
        result
    }

    fn put_locked(&mut self, hash: u64, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        if self.lookup(hash, key) {
            let old = self.cached_value();
            self.acquire(LockLevel::Write)?;
            let replaced = self.replace_value_cached(value);
            self.release(LockLevel::Write);
            replaced.map(|_| Some(old))
        } else {
            self.acquire(LockLevel::Write)?;
            let inserted = self.insert_entry(hash, key, value);
            self.release(LockLevel::Write);
            inserted.map(|_| None)
        }
    }

    /// Looks up `key`, returning a copy of its value.
    pub fn get(&mut self, hash: u64, key: &[u8]) -> Result<Option<Bytes>> {
        self.acquire(LockLevel::Read)?;
        let result = self.lookup(hash, key).then(|| self.cached_value());
        self.clear_cached();
        self.release(LockLevel::Read);
        Ok(result)
    }

    /// True if `key` is present.
    pub fn contains_key(&mut self, hash: u64, key: &[u8]) -> Result<bool> {
        self.acquire(LockLevel::Read)?;
        let found = self.lookup(hash, key);
        self.clear_cached();
        self.release(LockLevel::Read);
        Ok(found)
    }

    /// Removes `key`, returning its previous value. Removing an absent key
    /// leaves the segment untouched.
    pub fn remove(&mut self, hash: u64, key: &[u8]) -> Result<Option<Bytes>> {
        self.acquire(LockLevel::Update)?;
        let result = self.remove_locked(hash, key);
        self.clear_cached();
        self.release(LockLevel::Update);
        result
    }

    fn remove_locked(&mut self, hash: u64, key: &[u8]) -> Result<Option<Bytes>> {
        if !self.lookup(hash, key) {
            return Ok(None);
        }
        let old = self.cached_value();
        self.acquire(LockLevel::Write)?;
        self.remove_cached();
        self.release(LockLevel::Write);
        Ok(Some(old))
    }

    /// Replaces the value of an existing `key`, returning the previous
    /// value; absent keys are left absent.
    pub fn replace(&mut self, hash: u64, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        self.acquire(LockLevel::Update)?;
        let result = self.replace_locked(hash, key, value);
        self.clear_cached();
        self.release(LockLevel::Update);
        result
    }

    fn replace_locked(&mut self, hash: u64, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        if !self.lookup(hash, key) {
            return Ok(None);
        }
        let old = self.cached_value();
        self.acquire(LockLevel::Write)?;
        let replaced = self.replace_value_cached(value);
        self.release(LockLevel::Write);
        replaced.map(|_| Some(old))
    }

    /// Drops every entry in the segment.
    pub fn clear(&mut self) -> Result<()> {
        self.acquire(LockLevel::Write)?;
        self.segment.hash_lookup().clear();
        self.segment.freelist().clear_all();
        let header = self.segment.header();
        header.set_entries(0);
        header.set_deleted(0);
        header.bump_mod_count();
        self.release(LockLevel::Write);
        Ok(())
    }

    /// Probes for `key`, caching the matching slot and parsed entry.
    /// Caller holds at least a read lock.
    pub(crate) fn lookup(&mut self, hash: u64, key: &[u8]) -> bool {
        let table = self.segment.hash_lookup();
        let codec = self.segment.codec();
        let mut probe = table.search(table.mask_partial_hash(hash));
        while let Some((slot_pos, chunk_pos)) = probe.next_match() {
            let parsed = codec.parse(chunk_pos);
            if codec.key(&parsed) == key {
                self.hash_lookup_pos = Some(slot_pos);
                self.entry = Some(parsed);
                self.entry_removed = false;
                return true;
            }
        }
        false
    }

    fn cached_value(&self) -> Bytes {
        let entry = self.entry.expect("no cached entry");
        Bytes::copy_from_slice(self.segment.entry_value_bytes(&entry))
    }

    /// Allocates, writes, and publishes a fresh entry. Caller holds the
    /// write lock and has verified the key is absent.
    ///
    /// Live entries are capped one below the hash table capacity: probe
    /// sequences, backward-shift removes, and scans all terminate at an
    /// empty slot, so one must always remain.
    fn insert_entry(&mut self, hash: u64, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(self.lock.holds(LockLevel::Write));
        let layout = self.segment.layout();
        let codec = self.segment.codec();
        let header = self.segment.header();
        let chunks = codec.entry_chunks(key.len(), value.len());
        if header.entries() + 1 >= layout.capacity as u64 {
            return Err(StratumError::SegmentFull {
                segment: self.segment.index(),
                chunks,
            });
        }
        let list = self.segment.freelist();
        let pos = list.allocate(chunks)?;
        let parsed = codec.write_entry(pos as u64, key, value);
        let table = self.segment.hash_lookup();
        let Some(slot) = table.insert(table.mask_partial_hash(hash), pos as u64) else {
            list.free(pos, chunks);
            return Err(StratumError::SegmentFull {
                segment: self.segment.index(),
                chunks,
            });
        };
        header.add_entries(1);
        header.bump_mod_count();
        self.hash_lookup_pos = Some(slot);
        self.entry = Some(parsed);
        Ok(())
    }

    /// Replaces the cached entry's value per the in-place / grow / shrink
    /// / relocate protocol, then re-publishes its chunk position. Caller
    /// holds the write lock.
    pub(crate) fn replace_value_cached(&mut self, new_value: &[u8]) -> Result<()> {
        debug_assert!(self.lock.holds(LockLevel::Write));
        let entry = self.entry.expect("replace without a cached entry");
        let cursor = self.hash_lookup_pos.expect("replace without a cursor");
        let layout = self.segment.layout();
        let codec = self.segment.codec();
        let list = self.segment.freelist();

        let new_chunks = codec.entry_chunks(entry.key_size, new_value.len());
        if new_chunks > layout.max_chunks_per_entry {
            return Err(StratumError::EntryTooLarge {
                chunks: new_chunks,
                max: layout.max_chunks_per_entry,
            });
        }
        let pos = entry.pos as usize;
        let old_chunks = entry.chunks;

        let updated = if new_chunks == old_chunks {
            codec.write_value(&entry, new_value)
        } else if new_chunks > old_chunks
            && pos + new_chunks <= layout.chunks_per_segment
            && list.all_clear(pos + old_chunks, pos + new_chunks)
        {
            // In-place growth into the free chunks right after the entry.
            list.set_range(pos + old_chunks, pos + new_chunks);
            codec.write_value(&entry, new_value)
        } else if new_chunks < old_chunks {
            // Shrink in place; the freed tail does not move the hint.
            list.clear_range(pos + new_chunks, pos + old_chunks);
            codec.write_value(&entry, new_value)
        } else {
            // Relocate: free first so the allocator may reuse the old run.
            list.free(pos, old_chunks);
            let new_pos = match list.allocate(new_chunks) {
                Ok(p) => p,
                Err(err) => {
                    list.set_range(pos, pos + old_chunks);
                    return Err(err);
                }
            };
            codec.relocate(&entry, new_pos as u64, new_value)
        };

        self.segment
            .hash_lookup()
            .put_value_volatile(cursor, updated.pos);
        self.segment.header().bump_mod_count();
        self.entry = Some(updated);
        Ok(())
    }

    /// Removes the cached entry: backward-shift the hash slot, free the
    /// chunks, and adjust the counters. Steps the cursor back when the
    /// shift moved a later slot into the cursor position. Caller holds the
    /// write lock.
    pub(crate) fn remove_cached(&mut self) {
        debug_assert!(self.lock.holds(LockLevel::Write));
        let entry = self.entry.expect("remove without a cached entry");
        let cursor = self.hash_lookup_pos.expect("remove without a cursor");
        let table = self.segment.hash_lookup();
        let cleared = table.remove(cursor);
        if cleared != cursor {
            self.hash_lookup_pos = Some(table.step_back(cursor));
        }
        self.segment.freelist().free(entry.pos as usize, entry.chunks);
        let header = self.segment.header();
        header.add_entries(-1);
        header.add_deleted(1);
        header.bump_mod_count();
        self.entry = None;
        self.entry_removed = true;
    }
}
