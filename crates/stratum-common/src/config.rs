//! Configuration for a Stratum map.

use crate::{Result, StratumError};
use serde::{Deserialize, Serialize};

/// Tunables for a Stratum map.
///
/// The configuration is fixed at file creation time: it is serialized into
/// the global file header, and a subsequent open of the same file must
/// resolve to an identical configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapConfig {
    /// Allocation unit within a segment, in bytes.
    pub chunk_size: usize,
    /// Number of chunks per segment.
    pub chunks_per_segment: usize,
    /// Maximum number of chunks a single entry may span.
    pub max_chunks_per_entry: usize,
    /// Bytes reserved at the front of every entry for caller metadata.
    pub meta_data_bytes: usize,
    /// Address alignment of the value relative to the entry start.
    /// Must be a power of two.
    pub alignment: usize,
    /// True if every entry has the same key and value sizes.
    pub constantly_sized_entry: bool,
    /// Extra bytes reserved when sizing variable entries whose padding
    /// cannot be assumed minimal.
    pub worst_alignment: usize,
    /// Number of segments in the map.
    pub actual_segments: usize,
    /// Expected maximum number of live entries per segment.
    pub entries_per_segment: usize,
    /// Budget for a single blocking lock acquisition, in nanoseconds.
    pub lock_timeout_nanos: u64,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64,
            chunks_per_segment: 4096,
            max_chunks_per_entry: 4096,
            meta_data_bytes: 0,
            alignment: 8,
            constantly_sized_entry: false,
            worst_alignment: 7,
            actual_segments: 8,
            entries_per_segment: 2048,
            lock_timeout_nanos: 2_000_000_000,
        }
    }
}

impl MapConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(StratumError::ConfigError(
                "chunk_size must be non-zero".to_string(),
            ));
        }
        if self.chunks_per_segment == 0 {
            return Err(StratumError::ConfigError(
                "chunks_per_segment must be non-zero".to_string(),
            ));
        }
        if self.max_chunks_per_entry == 0 || self.max_chunks_per_entry > self.chunks_per_segment {
            return Err(StratumError::ConfigError(format!(
                "max_chunks_per_entry must be in 1..={}, got {}",
                self.chunks_per_segment, self.max_chunks_per_entry
            )));
        }
        if !self.alignment.is_power_of_two() {
            return Err(StratumError::ConfigError(format!(
                "alignment must be a power of two, got {}",
                self.alignment
            )));
        }
        if self.worst_alignment + 1 < self.alignment {
            return Err(StratumError::ConfigError(format!(
                "worst_alignment {} cannot cover alignment {}",
                self.worst_alignment, self.alignment
            )));
        }
        if self.actual_segments == 0 {
            return Err(StratumError::ConfigError(
                "actual_segments must be non-zero".to_string(),
            ));
        }
        if self.entries_per_segment == 0 {
            return Err(StratumError::ConfigError(
                "entries_per_segment must be non-zero".to_string(),
            ));
        }
        if self.lock_timeout_nanos == 0 {
            return Err(StratumError::ConfigError(
                "lock_timeout_nanos must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the total entry-space bytes of one segment.
    pub fn entry_space_bytes(&self) -> usize {
        self.chunks_per_segment * self.chunk_size
    }
}
