//! The map façade: key hashing, segment dispatch, and the public API.

use crate::file::MapFile;
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use stratum_common::{MapConfig, Result, SegmentLayout};
use stratum_lock::{ErrorListener, LoggingErrorListener};
use stratum_segment::{EntryView, Segment, SegmentContext};

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(1);

/// Customization hooks wrapping entry mutations, mirroring the view
/// operations. The defaults apply the operation unchanged.
pub trait EntryOperations: Send + Sync {
    /// Wraps an in-scan value replacement.
    fn replace_value(&self, entry: &mut EntryView<'_, '_>, new_value: &[u8]) -> Result<()> {
        entry.replace_value(new_value)
    }

    /// Wraps an in-scan removal.
    fn remove(&self, entry: &mut EntryView<'_, '_>) -> Result<()> {
        entry.remove()
    }

    /// Maps the caller's value to the stored value on insert.
    fn insert<'v>(&self, _key: &[u8], value: &'v [u8]) -> &'v [u8] {
        value
    }

    /// Value reported for an absent key by [`SharedMap::get_or_default`].
    fn default_value(&self, _key: &[u8]) -> Bytes {
        Bytes::new()
    }
}

/// The identity [`EntryOperations`].
pub struct DefaultEntryOperations;

impl EntryOperations for DefaultEntryOperations {}

/// A shared, persistent, off-heap hash map.
///
/// All state lives in a memory-mapped file partitioned into fixed-layout
/// segments; any number of threads in any number of processes may map the
/// same file concurrently. Operations take `&self`: the segment lock
/// protocol, not Rust ownership, serializes mutation.
pub struct SharedMap {
    file: MapFile,
    id: u64,
    timeout: Duration,
    listener: Box<dyn ErrorListener>,
    entry_ops: Box<dyn EntryOperations>,
}

impl std::fmt::Debug for SharedMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMap")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SharedMap {
    /// Creates a fresh map file at `path`.
    pub fn create(path: &Path, config: MapConfig) -> Result<Self> {
        Ok(Self::wrap(MapFile::create(path, config)?))
    }

    /// Opens an existing map file.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::wrap(MapFile::open(path)?))
    }

    /// Opens `path` if it exists (its configuration must match), creating
    /// it otherwise.
    pub fn open_or_create(path: &Path, config: MapConfig) -> Result<Self> {
        Ok(Self::wrap(MapFile::open_or_create(path, config)?))
    }

    fn wrap(file: MapFile) -> Self {
        let timeout = Duration::from_nanos(file.config().lock_timeout_nanos);
        Self {
            file,
            id: NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed),
            timeout,
            listener: Box::new(LoggingErrorListener),
            entry_ops: Box::new(DefaultEntryOperations),
        }
    }

    /// Replaces the error listener receiving lock-timeout reports.
    pub fn with_error_listener(mut self, listener: Box<dyn ErrorListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Replaces the entry operation hooks.
    pub fn with_entry_operations(mut self, ops: Box<dyn EntryOperations>) -> Self {
        self.entry_ops = ops;
        self
    }

    /// The layout shared by every segment.
    pub fn layout(&self) -> &SegmentLayout {
        self.file.layout()
    }

    /// The configuration the file was created with.
    pub fn config(&self) -> &MapConfig {
        self.file.config()
    }

    /// Number of segments.
    pub fn segments(&self) -> usize {
        self.layout().actual_segments
    }

    /// Hashes a key. Deterministic across processes, which is what lets
    /// two mappings of the same file agree on slot placement.
    pub fn hash_key(key: &[u8]) -> u64 {
        fxhash::hash64(key)
    }

    /// Segment a hash dispatches to. Uses the high hash bits; the hash
    /// lookup inside the segment uses the low bits, so the two choices
    /// stay independent.
    fn segment_index(&self, hash: u64) -> usize {
        ((hash >> 32) as usize) % self.segments()
    }

    /// Opens an access context on segment `index`.
    pub fn segment_context(&self, index: usize) -> Result<SegmentContext<'_>> {
        let segment = Segment::new(self.file.segment_region(index), self.file.layout(), index);
        SegmentContext::new(segment, self.id, self.timeout, self.listener.as_ref())
    }

    fn context_for(&self, hash: u64) -> Result<SegmentContext<'_>> {
        self.segment_context(self.segment_index(hash))
    }

    /// Inserts or replaces `key`, returning the previous value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        let hash = Self::hash_key(key);
        let stored = self.entry_ops.insert(key, value);
        self.context_for(hash)?.put(hash, key, stored)
    }

    /// Looks up `key`, returning a copy of its value.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let hash = Self::hash_key(key);
        self.context_for(hash)?.get(hash, key)
    }

    /// Looks up `key`, falling back to the entry operations' default
    /// value when absent.
    pub fn get_or_default(&self, key: &[u8]) -> Result<Bytes> {
        Ok(self
            .get(key)?
            .unwrap_or_else(|| self.entry_ops.default_value(key)))
    }

    /// True if `key` is present.
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        let hash = Self::hash_key(key);
        self.context_for(hash)?.contains_key(hash, key)
    }

    /// Removes `key`, returning its previous value.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let hash = Self::hash_key(key);
        self.context_for(hash)?.remove(hash, key)
    }

    /// Replaces the value of an existing `key`; absent keys stay absent.
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        let hash = Self::hash_key(key);
        self.context_for(hash)?.replace(hash, key, value)
    }

    /// Number of live entries across all segments.
    pub fn len(&self) -> u64 {
        (0..self.segments())
            .map(|i| {
                Segment::new(self.file.segment_region(i), self.file.layout(), i).size()
            })
            .sum()
    }

    /// True if no segment holds an entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry in every segment.
    pub fn clear(&self) -> Result<()> {
        for i in 0..self.segments() {
            self.segment_context(i)?.clear()?;
        }
        Ok(())
    }

    /// Visits every entry in the map read-only.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
    {
        for i in 0..self.segments() {
            self.segment_context(i)?.for_each(&mut f)?;
        }
        Ok(())
    }

    /// Scans every segment with a mutating predicate; see
    /// [`SegmentContext::for_each_remaining`]. Returns `false` when the
    /// predicate stopped the scan early.
    pub fn for_each_remaining<F>(&self, mut predicate: F) -> Result<bool>
    where
        F: FnMut(&mut EntryView<'_, '_>) -> Result<bool>,
    {
        for i in 0..self.segments() {
            if !self.segment_context(i)?.for_each_remaining(&mut predicate)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Keeps only the entries `predicate` approves of, removing the rest
    /// through the entry operation hooks.
    pub fn retain<F>(&self, mut predicate: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let ops = self.entry_ops.as_ref();
        self.for_each_remaining(|view| {
            if !predicate(view.key()?, view.value()?) {
                ops.remove(view)?;
            }
            Ok(true)
        })
        .map(|_| ())
    }

    /// Synchronizes the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_config() -> MapConfig {
        MapConfig {
            chunk_size: 32,
            chunks_per_segment: 128,
            max_chunks_per_entry: 128,
            entries_per_segment: 32,
            actual_segments: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(SharedMap::hash_key(b"key"), SharedMap::hash_key(b"key"));
        assert_ne!(SharedMap::hash_key(b"key"), SharedMap::hash_key(b"yek"));
    }

    #[test]
    fn test_segment_dispatch_in_range() {
        let dir = tempdir().unwrap();
        let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();
        for i in 0..100u32 {
            let idx = map.segment_index(SharedMap::hash_key(&i.to_le_bytes()));
            assert!(idx < 4);
        }
    }

    #[test]
    fn test_len_sums_segments() {
        let dir = tempdir().unwrap();
        let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();
        assert!(map.is_empty());
        for i in 0..40u32 {
            map.put(&i.to_le_bytes(), b"v").unwrap();
        }
        assert_eq!(map.len(), 40);
        let per_segment: u64 = (0..map.segments())
            .map(|i| map.segment_context(i).unwrap().size())
            .sum();
        assert_eq!(per_segment, 40);
    }

    #[test]
    fn test_get_or_default() {
        struct Defaulting;
        impl EntryOperations for Defaulting {
            fn default_value(&self, _key: &[u8]) -> Bytes {
                Bytes::from_static(b"missing")
            }
        }

        let dir = tempdir().unwrap();
        let map = SharedMap::create(&dir.path().join("m.stratum"), small_config())
            .unwrap()
            .with_entry_operations(Box::new(Defaulting));
        map.put(b"present", b"here").unwrap();
        assert_eq!(map.get_or_default(b"present").unwrap(), &b"here"[..]);
        assert_eq!(map.get_or_default(b"absent").unwrap(), &b"missing"[..]);
    }

    #[test]
    fn test_retain() {
        let dir = tempdir().unwrap();
        let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();
        for i in 0..20u8 {
            map.put(&[i], &[i]).unwrap();
        }
        map.retain(|key, _| key[0] % 2 == 0).unwrap();
        assert_eq!(map.len(), 10);
        for i in 0..20u8 {
            assert_eq!(map.contains_key(&[i]).unwrap(), i % 2 == 0);
        }
    }
}
