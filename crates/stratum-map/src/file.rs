//! Map file management: the global header and the shared mapping.
//!
//! File layout:
//! ```text
//! [ global header : 4096 bytes ]
//! [ segment 0     : segment_size bytes ]
//! [ segment 1     : segment_size bytes ]
//! ...
//! ```
//!
//! The global header pins down the map's geometry. Every process that maps
//! the file derives the same [`SegmentLayout`] from it, so all of them
//! agree on every byte offset.

use memmap2::MmapRaw;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use stratum_common::{MapConfig, Result, SegmentLayout, StratumError, GLOBAL_HEADER_SIZE};
use stratum_segment::Region;

/// Header at the beginning of every map file.
///
/// Layout (88 bytes, little-endian):
/// - magic: 4 bytes ("STRM")
/// - version: 4 bytes
/// - chunk_size: 8 bytes
/// - chunks_per_segment: 8 bytes
/// - max_chunks_per_entry: 8 bytes
/// - meta_data_bytes: 8 bytes
/// - alignment: 8 bytes
/// - worst_alignment: 8 bytes
/// - actual_segments: 8 bytes
/// - entries_per_segment: 8 bytes
/// - lock_timeout_nanos: 8 bytes
/// - constantly_sized_entry: 1 byte
/// - reserved: 3 bytes
/// - checksum: 4 bytes (crc32 of everything before it)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapFileHeader {
    /// Magic bytes identifying a Stratum map file.
    pub magic: [u8; 4],
    /// Format version.
    pub version: u32,
    /// The map's tunables.
    pub config: MapConfig,
    /// Header checksum.
    pub checksum: u32,
}

impl MapFileHeader {
    /// Magic bytes identifying a Stratum map file.
    pub const MAGIC: [u8; 4] = *b"STRM";
    /// Current format version.
    pub const VERSION: u32 = 1;
    /// Encoded size of the header in bytes.
    pub const SIZE: usize = 88;

    /// Creates a header for a fresh file.
    pub fn new(config: MapConfig) -> Self {
        let mut header = Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            config,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        header
    }

    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        crc32fast::hash(&bytes[..Self::SIZE - 4])
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let c = &self.config;
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&(c.chunk_size as u64).to_le_bytes());
        buf[16..24].copy_from_slice(&(c.chunks_per_segment as u64).to_le_bytes());
        buf[24..32].copy_from_slice(&(c.max_chunks_per_entry as u64).to_le_bytes());
        buf[32..40].copy_from_slice(&(c.meta_data_bytes as u64).to_le_bytes());
        buf[40..48].copy_from_slice(&(c.alignment as u64).to_le_bytes());
        buf[48..56].copy_from_slice(&(c.worst_alignment as u64).to_le_bytes());
        buf[56..64].copy_from_slice(&(c.actual_segments as u64).to_le_bytes());
        buf[64..72].copy_from_slice(&(c.entries_per_segment as u64).to_le_bytes());
        buf[72..80].copy_from_slice(&c.lock_timeout_nanos.to_le_bytes());
        buf[80] = c.constantly_sized_entry as u8;
        // bytes 81..84 reserved
        buf[84..88].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Deserializes a header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let u64_at = |at: usize| {
            u64::from_le_bytes([
                buf[at],
                buf[at + 1],
                buf[at + 2],
                buf[at + 3],
                buf[at + 4],
                buf[at + 5],
                buf[at + 6],
                buf[at + 7],
            ])
        };
        Self {
            magic: [buf[0], buf[1], buf[2], buf[3]],
            version: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            config: MapConfig {
                chunk_size: u64_at(8) as usize,
                chunks_per_segment: u64_at(16) as usize,
                max_chunks_per_entry: u64_at(24) as usize,
                meta_data_bytes: u64_at(32) as usize,
                alignment: u64_at(40) as usize,
                worst_alignment: u64_at(48) as usize,
                actual_segments: u64_at(56) as usize,
                entries_per_segment: u64_at(64) as usize,
                lock_timeout_nanos: u64_at(72),
                constantly_sized_entry: buf[80] != 0,
            },
            checksum: u32::from_le_bytes([buf[84], buf[85], buf[86], buf[87]]),
        }
    }

    /// Validates magic, version, and checksum.
    pub fn validate(&self) -> Result<()> {
        if self.magic != Self::MAGIC {
            return Err(StratumError::CorruptHeader {
                reason: "invalid magic bytes".to_string(),
            });
        }
        if self.version != Self::VERSION {
            return Err(StratumError::CorruptHeader {
                reason: format!("unsupported version: {}", self.version),
            });
        }
        if self.checksum != self.compute_checksum() {
            return Err(StratumError::CorruptHeader {
                reason: "header checksum mismatch".to_string(),
            });
        }
        Ok(())
    }
}

/// An open, mapped Stratum file.
///
/// The mapping is `MAP_SHARED`: every other thread and process mapping the
/// same path sees the same bytes.
pub struct MapFile {
    map: MmapRaw,
    layout: SegmentLayout,
    config: MapConfig,
    path: PathBuf,
}

impl std::fmt::Debug for MapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapFile")
            .field("layout", &self.layout)
            .field("config", &self.config)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl MapFile {
    /// Creates a fresh map file at `path`. Fails if the path exists.
    pub fn create(path: &Path, config: MapConfig) -> Result<Self> {
        let layout = SegmentLayout::new(&config)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(layout.file_size() as u64)?;
        let map = MmapRaw::map_raw(&file)?;

        let header = MapFileHeader::new(config.clone());
        let region = region_over(&map);
        region.write_bytes(0, &header.to_bytes());
        map.flush()?;

        log::debug!(
            "created map file {:?}: {} segments of {} bytes",
            path,
            layout.actual_segments,
            layout.segment_size
        );
        Ok(Self {
            map,
            layout,
            config,
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing map file, validating its header.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < GLOBAL_HEADER_SIZE {
            return Err(StratumError::CorruptHeader {
                reason: format!("file is only {} bytes", file_len),
            });
        }
        let map = MmapRaw::map_raw(&file)?;
        let region = region_over(&map);

        let header = MapFileHeader::from_bytes(region.bytes(0, MapFileHeader::SIZE));
        header.validate()?;
        let config = header.config;
        let layout = SegmentLayout::new(&config)?;
        if file_len != layout.file_size() {
            return Err(StratumError::CorruptHeader {
                reason: format!(
                    "file is {} bytes, layout requires {}",
                    file_len,
                    layout.file_size()
                ),
            });
        }

        log::debug!("opened map file {:?}: {} segments", path, layout.actual_segments);
        Ok(Self {
            map,
            layout,
            config,
            path: path.to_path_buf(),
        })
    }

    /// Opens `path` if it exists (verifying its configuration matches),
    /// creating it otherwise.
    ///
    /// Atomic against other `open_or_create` calls in this process; two
    /// processes racing on a fresh path still need external coordination.
    pub fn open_or_create(path: &Path, config: MapConfig) -> Result<Self> {
        static OPEN_OR_CREATE: Mutex<()> = Mutex::new(());
        let _guard = OPEN_OR_CREATE.lock();
        if path.exists() {
            let opened = Self::open(path)?;
            if opened.config != config {
                return Err(StratumError::ConfigError(format!(
                    "existing file {:?} was created with a different configuration",
                    path
                )));
            }
            Ok(opened)
        } else {
            Self::create(path, config)
        }
    }

    /// The layout every segment of this file follows.
    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    /// The configuration the file was created with.
    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    /// Path this file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Region over segment `i`.
    pub fn segment_region(&self, i: usize) -> Region {
        region_over(&self.map).window(self.layout.segment_offset(i), self.layout.segment_size)
    }

    /// Synchronizes the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

fn region_over(map: &MmapRaw) -> Region {
    // Safety: the mapping is page-aligned and stays valid until `map` is
    // dropped; MapFile owns the MmapRaw for as long as regions derived
    // here are reachable.
    unsafe { Region::new(map.as_mut_ptr(), map.len()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_header_roundtrip() {
        let header = MapFileHeader::new(MapConfig::default());
        let bytes = header.to_bytes();
        let recovered = MapFileHeader::from_bytes(&bytes);
        assert_eq!(header, recovered);
        assert!(recovered.validate().is_ok());
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut header = MapFileHeader::new(MapConfig::default());
        header.magic = *b"NOPE";
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let header = MapFileHeader::new(MapConfig::default());
        let mut bytes = header.to_bytes();
        bytes[4] = 99;
        assert!(MapFileHeader::from_bytes(&bytes).validate().is_err());
    }

    #[test]
    fn test_header_rejects_tampered_field() {
        let header = MapFileHeader::new(MapConfig::default());
        let mut bytes = header.to_bytes();
        bytes[16] ^= 0xff; // chunks_per_segment
        let err = MapFileHeader::from_bytes(&bytes).validate().unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_create_then_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.stratum");
        let config = MapConfig {
            actual_segments: 2,
            ..Default::default()
        };

        let created = MapFile::create(&path, config.clone()).unwrap();
        let expected_size = created.layout().file_size();
        drop(created);

        assert_eq!(
            std::fs::metadata(&path).unwrap().len() as usize,
            expected_size
        );
        let opened = MapFile::open(&path).unwrap();
        assert_eq!(opened.config(), &config);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.stratum");
        MapFile::create(&path, MapConfig::default()).unwrap();
        assert!(MapFile::create(&path, MapConfig::default()).is_err());
    }

    #[test]
    fn test_open_refuses_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.stratum");
        std::fs::write(&path, b"STRM").unwrap();
        let err = MapFile::open(&path).unwrap_err();
        assert!(matches!(err, StratumError::CorruptHeader { .. }));
    }

    #[test]
    fn test_open_or_create_rejects_config_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.stratum");
        MapFile::open_or_create(&path, MapConfig::default()).unwrap();

        let other = MapConfig {
            chunk_size: 128,
            ..Default::default()
        };
        let err = MapFile::open_or_create(&path, other).unwrap_err();
        assert!(matches!(err, StratumError::ConfigError(_)));

        // The matching configuration still opens.
        MapFile::open_or_create(&path, MapConfig::default()).unwrap();
    }

    #[test]
    fn test_segment_regions_are_disjoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.stratum");
        let config = MapConfig {
            actual_segments: 2,
            ..Default::default()
        };
        let file = MapFile::create(&path, config).unwrap();

        let a = file.segment_region(0);
        let b = file.segment_region(1);
        a.write_u64(8, 0x1111);
        b.write_u64(8, 0x2222);
        assert_eq!(a.read_u64(8), 0x1111);
        assert_eq!(b.read_u64(8), 0x2222);
    }

    #[test]
    fn test_fresh_segments_are_zeroed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.stratum");
        let file = MapFile::create(&path, MapConfig::default()).unwrap();
        let region = file.segment_region(0);
        for offset in [0usize, 64, 1024] {
            assert_eq!(region.read_u64(offset), 0);
        }
    }
}
