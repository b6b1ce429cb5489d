//! Stratum: a shared, persistent, off-heap hash map.
//!
//! The entire map state lives in a memory-mapped file partitioned into
//! fixed-layout segments, accessible concurrently by multiple threads and
//! multiple processes mapping the same file.
//!
//! ```no_run
//! use stratum_map::{MapConfig, SharedMap};
//!
//! # fn main() -> stratum_common::Result<()> {
//! let map = SharedMap::open_or_create("data.stratum".as_ref(), MapConfig::default())?;
//! map.put(b"key", b"value")?;
//! assert_eq!(map.get(b"key")?.as_deref(), Some(&b"value"[..]));
//!
//! // Scan with in-place mutation: predicates may replace or remove the
//! // entry under the cursor.
//! map.for_each_remaining(|entry| {
//!     if entry.value()?.len() > 1024 {
//!         entry.remove()?;
//!     }
//!     Ok(true)
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod file;
pub mod map;

pub use file::{MapFile, MapFileHeader};
pub use map::{DefaultEntryOperations, EntryOperations, SharedMap};

pub use stratum_common::{MapConfig, Result, SegmentLayout, StratumError};
pub use stratum_lock::{ErrorListener, LockLevel, LoggingErrorListener};
pub use stratum_segment::{EntryView, SegmentContext};
