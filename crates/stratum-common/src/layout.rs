//! Byte layout of the mapped file and of each segment.
//!
//! File layout:
//! ```text
//! +----------------------------------+
//! | Global header (4096)             |
//! +----------------------------------+
//! | Segment 0 (segment_size)         |
//! +----------------------------------+
//! | Segment 1 (segment_size)         |
//! +----------------------------------+
//! | ...                              |
//! +----------------------------------+
//! ```
//!
//! Segment layout, all regions 64-byte aligned:
//! ```text
//! +----------------------------------+
//! | Segment header (64)              |
//! +----------------------------------+
//! | Hash lookup table                |
//! | (capacity x slot_byte_size)      |
//! +----------------------------------+
//! | Free list bitset                 |
//! | (chunks_per_segment bits)        |
//! +----------------------------------+
//! | Entry space                      |
//! | (chunks_per_segment x chunk_size)|
//! +----------------------------------+
//! ```

use crate::{MapConfig, Result, StratumError};

/// Size of the global file header in bytes.
pub const GLOBAL_HEADER_SIZE: usize = 4096;

/// Size of the per-segment header in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 64;

/// Region alignment within a segment.
const REGION_ALIGNMENT: usize = 64;

/// Extra partial-hash bits kept in a slot beyond the bits that address the
/// table, reducing false positives on probe.
const EXTRA_KEY_BITS: u32 = 8;

/// Rounds `n` up to a multiple of `alignment` (a power of two).
pub const fn align_up(n: usize, alignment: usize) -> usize {
    (n + alignment - 1) & !(alignment - 1)
}

/// Derived byte layout and slot geometry of one segment.
///
/// Computed once from a [`MapConfig`] and shared by every component that
/// addresses the mapping. All offsets are relative to the segment start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLayout {
    /// Allocation unit in bytes.
    pub chunk_size: usize,
    /// Chunks per segment; chunk positions are `0..chunks_per_segment`.
    pub chunks_per_segment: usize,
    /// Maximum chunks a single entry may span.
    pub max_chunks_per_entry: usize,
    /// Bytes reserved at the front of every entry for caller metadata.
    pub meta_data_bytes: usize,
    /// Value alignment relative to the entry start; a power of two.
    pub alignment: usize,
    /// Extra bytes reserved when sizing variable entries.
    pub worst_alignment: usize,
    /// True if every entry has the same key and value sizes.
    pub constantly_sized_entry: bool,

    /// Hash lookup slot count; a power of two.
    pub capacity: usize,
    /// `capacity - 1`.
    pub capacity_mask: u64,
    /// Low bits of a slot holding the partial hash.
    pub key_bits: u32,
    /// Bits above the key bits holding the chunk position.
    pub value_bits: u32,
    /// Bytes per hash lookup slot: 4 or 8.
    pub slot_byte_size: usize,
    /// Mask selecting the partial hash within a slot word.
    pub key_mask: u64,
    /// Mask selecting the in-place chunk position bits of a slot word.
    pub value_mask: u64,
    /// Mask selecting the `key_bits + value_bits` low bits of a slot word.
    /// Bits above this mask do not belong to the hash lookup and are
    /// preserved across slot writes.
    pub entry_mask: u64,

    /// Byte offset of the hash lookup table within the segment.
    pub hash_lookup_offset: usize,
    /// Byte size of the hash lookup table.
    pub hash_lookup_size: usize,
    /// Byte offset of the free list bitset within the segment.
    pub freelist_offset: usize,
    /// Free list size in 64-bit words.
    pub freelist_words: usize,
    /// Byte offset of the entry space within the segment.
    pub entry_space_offset: usize,
    /// Total segment size in bytes, after cache-set offsetting.
    pub segment_size: usize,

    /// Number of segments in the file.
    pub actual_segments: usize,
}

impl SegmentLayout {
    /// Computes the layout for a validated configuration.
    pub fn new(config: &MapConfig) -> Result<Self> {
        config.validate()?;

        // A power-of-two capacity of at least 1.5x the expected entries
        // keeps the linear-probe load factor below 2/3.
        let min_capacity = (3 * config.entries_per_segment).div_ceil(2);
        let capacity = min_capacity.next_power_of_two();
        let capacity_mask = capacity as u64 - 1;
        let cap_bits = capacity.trailing_zeros();

        let value_bits = config
            .chunks_per_segment
            .next_power_of_two()
            .trailing_zeros()
            .max(1);
        let key_bits = cap_bits + EXTRA_KEY_BITS;
        let entry_bits = key_bits + value_bits;
        if entry_bits > 64 {
            return Err(StratumError::ConfigError(format!(
                "slot would need {} bits ({} key + {} value), max is 64",
                entry_bits, key_bits, value_bits
            )));
        }
        let slot_byte_size = if entry_bits <= 32 { 4 } else { 8 };

        let key_mask = (1u64 << key_bits) - 1;
        let value_mask = ((1u64 << value_bits) - 1) << key_bits;
        let entry_mask = if entry_bits == 64 {
            u64::MAX
        } else {
            (1u64 << entry_bits) - 1
        };

        let hash_lookup_offset = SEGMENT_HEADER_SIZE;
        let hash_lookup_size = capacity * slot_byte_size;
        let freelist_offset = align_up(hash_lookup_offset + hash_lookup_size, REGION_ALIGNMENT);
        let freelist_words = config.chunks_per_segment.div_ceil(64);
        let entry_space_offset = align_up(freelist_offset + freelist_words * 8, REGION_ALIGNMENT);

        let raw_size = entry_space_offset + config.entry_space_bytes();
        let segment_size = offset_cache_sets(align_up(raw_size, REGION_ALIGNMENT));

        Ok(Self {
            chunk_size: config.chunk_size,
            chunks_per_segment: config.chunks_per_segment,
            max_chunks_per_entry: config.max_chunks_per_entry,
            meta_data_bytes: config.meta_data_bytes,
            alignment: config.alignment,
            worst_alignment: config.worst_alignment,
            constantly_sized_entry: config.constantly_sized_entry,
            capacity,
            capacity_mask,
            key_bits,
            value_bits,
            slot_byte_size,
            key_mask,
            value_mask,
            entry_mask,
            hash_lookup_offset,
            hash_lookup_size,
            freelist_offset,
            freelist_words,
            entry_space_offset,
            segment_size,
            actual_segments: config.actual_segments,
        })
    }

    /// Byte offset of segment `i` within the file.
    pub fn segment_offset(&self, i: usize) -> usize {
        debug_assert!(i < self.actual_segments);
        GLOBAL_HEADER_SIZE + i * self.segment_size
    }

    /// Byte offset of segment `i`'s header within the file.
    pub fn segment_header_offset(&self, i: usize) -> usize {
        self.segment_offset(i)
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> usize {
        GLOBAL_HEADER_SIZE + self.actual_segments * self.segment_size
    }

    /// Packs a masked partial hash and a chunk position into a slot word.
    pub fn pack_slot(&self, partial_hash: u64, chunk_pos: u64) -> u64 {
        debug_assert_eq!(partial_hash & !self.key_mask, 0);
        debug_assert!(chunk_pos < self.chunks_per_segment as u64);
        partial_hash | (chunk_pos << self.key_bits)
    }

    /// Extracts the partial hash from a slot word.
    pub fn slot_key(&self, slot: u64) -> u64 {
        slot & self.key_mask
    }

    /// Extracts the chunk position from a slot word.
    pub fn slot_value(&self, slot: u64) -> u64 {
        (slot & self.value_mask) >> self.key_bits
    }
}

/// Bumps a segment size in 64-byte steps until `(size & 4093) >= 64`.
///
/// Segment headers sit at `GLOBAL_HEADER_SIZE + i * segment_size`; if the
/// segment size were a multiple of the page size their headers would all
/// land in the same L1 cache sets across segments.
fn offset_cache_sets(mut size: usize) -> usize {
    while size & 4093 < 64 {
        size += 64;
    }
    size
}
