//! Entry layout codec.
//!
//! An entry occupies a contiguous run of chunks and lays out as:
//!
//! ```text
//! +---------------------------+
//! | meta bytes (fixed width)  |
//! +---------------------------+
//! | key size (stop-bit)       |
//! +---------------------------+
//! | key bytes                 |
//! +---------------------------+
//! | value size (stop-bit)     |
//! +---------------------------+
//! | zero padding to alignment |
//! +---------------------------+
//! | value bytes               |
//! +---------------------------+
//! ```
//!
//! The value starts at the configured alignment relative to the entry
//! start. Constant-sized entries are sized exactly; variable-sized entries
//! reserve `worst_alignment` extra bytes so their chunk count does not
//! depend on how much padding a particular key needs.
//!
//! All reads and writes are absolute against the mapped segment; key and
//! value reads are borrowed views into the mapping.

use crate::region::Region;
use bytes::Bytes;
use stratum_common::{align_up, sizecodec, SegmentLayout};

/// Location of one live entry's fields, all offsets absolute within the
/// segment region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedEntry {
    /// Chunk position the entry starts at.
    pub pos: u64,
    /// Key length in bytes.
    pub key_size: usize,
    /// Offset of the key bytes.
    pub key_offset: usize,
    /// Offset of the encoded value size.
    pub value_size_offset: usize,
    /// Value length in bytes.
    pub value_size: usize,
    /// Offset of the value bytes.
    pub value_offset: usize,
    /// Chunks the entry occupies.
    pub chunks: usize,
}

/// Serializes entries into and out of a segment's entry space.
#[derive(Clone, Copy)]
pub struct EntryCodec<'a> {
    region: Region,
    layout: &'a SegmentLayout,
}

impl<'a> EntryCodec<'a> {
    /// Creates a codec; `region` must start at the segment base.
    pub fn new(region: Region, layout: &'a SegmentLayout) -> Self {
        Self { region, layout }
    }

    /// Absolute offset of chunk `pos` within the segment.
    pub fn entry_offset(&self, pos: u64) -> usize {
        debug_assert!((pos as usize) < self.layout.chunks_per_segment);
        self.layout.entry_space_offset + pos as usize * self.layout.chunk_size
    }

    /// Bytes before the value size padding: meta, encoded key size, key,
    /// encoded value size.
    fn size_before_value(&self, key_size: usize, value_size: usize) -> usize {
        self.layout.meta_data_bytes
            + sizecodec::encoding_size(key_size as u64)
            + key_size
            + sizecodec::encoding_size(value_size as u64)
    }

    /// Entry size in bytes for the given key and value sizes.
    ///
    /// Constant-sized entries place the value at the aligned offset and
    /// stop there; variable-sized entries reserve `worst_alignment` extra
    /// bytes instead of the actual padding.
    pub fn entry_size(&self, key_size: usize, value_size: usize) -> usize {
        let before = self.size_before_value(key_size, value_size);
        if self.layout.constantly_sized_entry {
            align_up(before, self.layout.alignment) + value_size
        } else {
            before + self.layout.worst_alignment + value_size
        }
    }

    /// Chunks needed for an entry of `size` bytes.
    pub fn chunks_for_size(&self, size: usize) -> usize {
        size.div_ceil(self.layout.chunk_size)
    }

    /// Chunks needed for the given key and value sizes.
    pub fn entry_chunks(&self, key_size: usize, value_size: usize) -> usize {
        self.chunks_for_size(self.entry_size(key_size, value_size))
    }

    /// Writes a fresh entry at chunk `pos`. Meta bytes and padding are
    /// zeroed. Caller holds the write lock and owns the chunk run.
    pub fn write_entry(&self, pos: u64, key: &[u8], value: &[u8]) -> ParsedEntry {
        let base = self.entry_offset(pos);
        let mut offset = base;

        self.region.zero(offset, self.layout.meta_data_bytes);
        offset += self.layout.meta_data_bytes;

        offset += self.write_size_at(offset, key.len());
        self.region.write_bytes(offset, key);
        let key_offset = offset;
        offset += key.len();

        let value_size_offset = offset;
        let value_offset = self.write_value_at(base, value_size_offset, value);

        ParsedEntry {
            pos,
            key_size: key.len(),
            key_offset,
            value_size_offset,
            value_size: value.len(),
            value_offset,
            chunks: self.entry_chunks(key.len(), value.len()),
        }
    }

    /// Reads the entry at chunk `pos`. Caller holds at least a read lock.
    pub fn parse(&self, pos: u64) -> ParsedEntry {
        let base = self.entry_offset(pos);
        let mut offset = base + self.layout.meta_data_bytes;

        let (key_size, key_size_len) = self.read_size_at(offset);
        offset += key_size_len;
        let key_offset = offset;
        offset += key_size;

        let value_size_offset = offset;
        let (value_size, value_size_len) = self.read_size_at(value_size_offset);
        let value_offset = base
            + align_up(
                value_size_offset + value_size_len - base,
                self.layout.alignment,
            );

        ParsedEntry {
            pos,
            key_size,
            key_offset,
            value_size_offset,
            value_size,
            value_offset,
            chunks: self.entry_chunks(key_size, value_size),
        }
    }

    /// Rewrites the value of an existing entry in place (same chunk run),
    /// re-encoding the value size and re-padding. Caller holds the write
    /// lock and has sized the run to fit.
    pub fn write_value(&self, entry: &ParsedEntry, value: &[u8]) -> ParsedEntry {
        let base = self.entry_offset(entry.pos);
        let value_offset = self.write_value_at(base, entry.value_size_offset, value);
        ParsedEntry {
            value_size: value.len(),
            value_offset,
            chunks: self.entry_chunks(entry.key_size, value.len()),
            ..*entry
        }
    }

    /// Writes a relocated copy of `entry` at chunk `new_pos` with a new
    /// value: the prefix up to and including the key is copied verbatim,
    /// then the value is encoded fresh. The runs may overlap (the old run
    /// is typically freed before the new one is allocated).
    pub fn relocate(&self, entry: &ParsedEntry, new_pos: u64, value: &[u8]) -> ParsedEntry {
        let old_base = self.entry_offset(entry.pos);
        let new_base = self.entry_offset(new_pos);
        let prefix_len = entry.value_size_offset - old_base;
        if new_base != old_base {
            self.region.copy_within(old_base, new_base, prefix_len);
        }
        let value_size_offset = new_base + prefix_len;
        let value_offset = self.write_value_at(new_base, value_size_offset, value);
        ParsedEntry {
            pos: new_pos,
            key_size: entry.key_size,
            key_offset: new_base + (entry.key_offset - old_base),
            value_size_offset,
            value_size: value.len(),
            value_offset,
            chunks: self.entry_chunks(entry.key_size, value.len()),
        }
    }

    /// Borrows the key bytes of a parsed entry.
    pub fn key(&self, entry: &ParsedEntry) -> &[u8] {
        self.region.bytes(entry.key_offset, entry.key_size)
    }

    /// Borrows the value bytes of a parsed entry.
    pub fn value(&self, entry: &ParsedEntry) -> &[u8] {
        self.region.bytes(entry.value_offset, entry.value_size)
    }

    /// Owned copy of the value bytes.
    pub fn value_bytes(&self, entry: &ParsedEntry) -> Bytes {
        Bytes::copy_from_slice(self.value(entry))
    }

    /// Encodes the value size at `value_size_offset`, zeroes the padding
    /// up to the aligned value offset, and writes the value. Returns the
    /// absolute value offset.
    fn write_value_at(&self, base: usize, value_size_offset: usize, value: &[u8]) -> usize {
        let mut offset = value_size_offset;
        offset += self.write_size_at(offset, value.len());
        let value_offset = base + align_up(offset - base, self.layout.alignment);
        self.region.zero(offset, value_offset - offset);
        self.region.write_bytes(value_offset, value);
        value_offset
    }

    fn write_size_at(&self, offset: usize, size: usize) -> usize {
        let mut buf = [0u8; sizecodec::MAX_ENCODED_SIZE];
        let len = sizecodec::write_size(&mut buf, size as u64);
        self.region.write_bytes(offset, &buf[..len]);
        len
    }

    fn read_size_at(&self, offset: usize) -> (usize, usize) {
        let view = self
            .region
            .bytes(offset, sizecodec::MAX_ENCODED_SIZE.min(self.region.len() - offset));
        let (size, len) = sizecodec::read_size(view);
        (size as usize, len)
    }
}
