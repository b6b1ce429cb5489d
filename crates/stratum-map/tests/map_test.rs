//! End-to-end validation of the shared map.
//!
//! Covers:
//! - Persistence across close and reopen
//! - Two handles mapping the same file
//! - Point operation laws (put/get/replace/remove idempotence)
//! - Random operation sequences against a model map
//! - The lock protocol surface (reentrancy, forbidden upgrades)
//! - Scans concurrent with same-size replaces
//! - State exhaustion back to an empty map

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use stratum_map::{LockLevel, MapConfig, SharedMap, StratumError};
use tempfile::tempdir;

// =============================================================================
// Helpers
// =============================================================================

fn small_config() -> MapConfig {
    MapConfig {
        chunk_size: 32,
        chunks_per_segment: 256,
        max_chunks_per_entry: 256,
        entries_per_segment: 64,
        actual_segments: 4,
        ..Default::default()
    }
}

fn key(i: u32) -> Vec<u8> {
    format!("key-{:05}", i).into_bytes()
}

fn value(i: u32, len: usize) -> Vec<u8> {
    let mut v = format!("value-{:05}-", i).into_bytes();
    v.resize(len.max(v.len()), (i % 251) as u8);
    v
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_put_get_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.stratum");

    {
        let map = SharedMap::create(&path, small_config()).unwrap();
        for i in 0..100 {
            map.put(&key(i), &value(i, 20 + (i as usize % 60))).unwrap();
        }
        assert_eq!(map.len(), 100);
        map.flush().unwrap();
    }

    let reopened = SharedMap::open(&path).unwrap();
    assert_eq!(reopened.len(), 100);
    for i in 0..100 {
        assert_eq!(
            reopened.get(&key(i)).unwrap().as_deref(),
            Some(&value(i, 20 + (i as usize % 60))[..]),
            "key {} lost across reopen",
            i
        );
    }
}

#[test]
fn test_open_missing_file_fails() {
    let dir = tempdir().unwrap();
    let err = SharedMap::open(&dir.path().join("nope.stratum")).unwrap_err();
    assert!(matches!(err, StratumError::Io(_)));
}

// =============================================================================
// Multiple handles over one file
// =============================================================================

#[test]
fn test_two_handles_share_state() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.stratum");

    let writer = SharedMap::create(&path, small_config()).unwrap();
    let reader = SharedMap::open(&path).unwrap();

    writer.put(b"from-writer", b"hello").unwrap();
    assert_eq!(
        reader.get(b"from-writer").unwrap().as_deref(),
        Some(&b"hello"[..])
    );
    assert_eq!(reader.len(), 1);

    reader.remove(b"from-writer").unwrap();
    assert_eq!(writer.get(b"from-writer").unwrap(), None);
    assert!(writer.is_empty());
}

// =============================================================================
// Point operation laws
// =============================================================================

#[test]
fn test_put_put_get_sees_latest() {
    let dir = tempdir().unwrap();
    let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();

    map.put(b"k", b"v1").unwrap();
    map.put(b"k", b"v2").unwrap();
    assert_eq!(map.get(b"k").unwrap().as_deref(), Some(&b"v2"[..]));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_remove_twice_second_is_absent_noop() {
    let dir = tempdir().unwrap();
    let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();

    map.put(b"k", b"v").unwrap();
    assert_eq!(map.remove(b"k").unwrap().as_deref(), Some(&b"v"[..]));

    let used_before: usize = (0..map.segments())
        .map(|i| {
            map.segment_context(i)
                .unwrap()
                .segment()
                .freelist()
                .used_chunks()
        })
        .sum();
    assert_eq!(map.remove(b"k").unwrap(), None);
    let used_after: usize = (0..map.segments())
        .map(|i| {
            map.segment_context(i)
                .unwrap()
                .segment()
                .freelist()
                .used_chunks()
        })
        .sum();
    assert_eq!(used_before, used_after);
    assert_eq!(map.len(), 0);
}

#[test]
fn test_value_resize_cycle() {
    let dir = tempdir().unwrap();
    let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();

    map.put(b"k", b"small").unwrap();
    let big = vec![0xabu8; 150];
    map.put(b"k", &big).unwrap();
    assert_eq!(map.get(b"k").unwrap().unwrap(), big);

    let same_size = vec![0xcdu8; 150];
    map.replace(b"k", &same_size).unwrap();
    assert_eq!(map.get(b"k").unwrap().unwrap(), same_size);

    map.put(b"k", b"tiny").unwrap();
    assert_eq!(map.get(b"k").unwrap().as_deref(), Some(&b"tiny"[..]));

    map.remove(b"k").unwrap();
    assert!(map.is_empty());
}

// =============================================================================
// Random operations against a model
// =============================================================================

#[test]
fn test_random_ops_match_model_and_drain_to_empty() {
    let dir = tempdir().unwrap();
    let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();
    let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..2000 {
        let k = key(rng.gen_range(0..50));
        match rng.gen_range(0..4) {
            0 | 1 => {
                let v = value(rng.gen(), rng.gen_range(1..120));
                let previous = map.put(&k, &v).unwrap();
                let model_previous = model.insert(k, v);
                assert_eq!(previous.as_deref(), model_previous.as_deref());
            }
            2 => {
                let previous = map.remove(&k).unwrap();
                let model_previous = model.remove(&k);
                assert_eq!(previous.as_deref(), model_previous.as_deref());
            }
            _ => {
                assert_eq!(
                    map.get(&k).unwrap().as_deref(),
                    model.get(&k).map(|v| &v[..])
                );
            }
        }
        assert_eq!(map.len() as usize, model.len());
    }

    // Drain everything and verify the segments are genuinely empty again.
    for k in model.keys() {
        assert!(map.remove(k).unwrap().is_some());
    }
    assert_eq!(map.len(), 0);
    for i in 0..map.segments() {
        let ctx = map.segment_context(i).unwrap();
        assert_eq!(ctx.segment().freelist().used_chunks(), 0);
        assert_eq!(ctx.segment().hash_lookup().occupied_slots(), 0);
    }
}

// =============================================================================
// Lock protocol surface
// =============================================================================

#[test]
fn test_read_lock_reentrancy_leaves_word_unlocked() {
    let dir = tempdir().unwrap();
    let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();

    let mut ctx = map.segment_context(0).unwrap();
    ctx.read_lock().unwrap();
    ctx.read_lock().unwrap();
    ctx.release(LockLevel::Read);
    ctx.release(LockLevel::Read);
    assert_eq!(
        ctx.segment()
            .lock_word()
            .load(std::sync::atomic::Ordering::Acquire),
        0
    );
}

#[test]
fn test_upgrade_from_read_is_rejected() {
    let dir = tempdir().unwrap();
    let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();

    let mut ctx = map.segment_context(0).unwrap();
    ctx.read_lock().unwrap();
    let err = ctx.try_acquire(LockLevel::Update).unwrap_err();
    assert!(matches!(err, StratumError::IllegalUpgrade { .. }));
}

#[test]
fn test_second_context_on_same_segment_rejected() {
    let dir = tempdir().unwrap();
    let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();

    let _first = map.segment_context(0).unwrap();
    let err = map.segment_context(0).map(|_| ()).unwrap_err();
    assert!(matches!(err, StratumError::NestedContext { segment: 0 }));
    // A different segment is fine.
    map.segment_context(1).unwrap();
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_threads_on_disjoint_keys() {
    let dir = tempdir().unwrap();
    let map = Arc::new(SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap());

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let map = Arc::clone(&map);
        handles.push(std::thread::spawn(move || {
            let base = t * 50;
            for i in base..base + 50 {
                map.put(&key(i), &value(i, 30)).unwrap();
            }
            for i in base..base + 50 {
                assert_eq!(
                    map.get(&key(i)).unwrap().as_deref(),
                    Some(&value(i, 30)[..])
                );
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(map.len(), 200);
}

#[test]
fn test_scan_with_concurrent_same_size_replaces() {
    let dir = tempdir().unwrap();
    let config = MapConfig {
        actual_segments: 1,
        ..small_config()
    };
    let path = dir.path().join("m.stratum");
    let scanner_map = Arc::new(SharedMap::create(&path, config).unwrap());
    let writer_map = Arc::new(SharedMap::open(&path).unwrap());

    const ENTRIES: u32 = 16;
    const A: &[u8; 8] = b"AAAAAAAA";
    const B: &[u8; 8] = b"BBBBBBBB";
    for i in 0..ENTRIES {
        scanner_map.put(&key(i), A).unwrap();
    }

    let writer = std::thread::spawn(move || {
        for round in 0..50u32 {
            let pattern = if round % 2 == 0 { B } else { A };
            for i in 0..ENTRIES {
                writer_map.replace(&key(i), pattern).unwrap();
            }
        }
    });

    for _ in 0..50 {
        let mut visits = 0;
        scanner_map
            .for_each(|_, value| {
                visits += 1;
                let uniform = value == A || value == B;
                assert!(uniform, "torn value observed: {:?}", value);
            })
            .unwrap();
        assert_eq!(visits, ENTRIES);
    }

    writer.join().unwrap();
    assert_eq!(scanner_map.len(), ENTRIES as u64);
}

// =============================================================================
// Scans
// =============================================================================

#[test]
fn test_for_each_remaining_interrupt() {
    let dir = tempdir().unwrap();
    let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();
    for i in 0..30 {
        map.put(&key(i), b"v").unwrap();
    }

    let mut visits = 0;
    let completed = map
        .for_each_remaining(|_| {
            visits += 1;
            Ok(visits < 5)
        })
        .unwrap();
    assert!(!completed);
    assert_eq!(visits, 5);
    // Everything is still present: interruption rolls nothing back.
    assert_eq!(map.len(), 30);
}

#[test]
fn test_scan_remove_drains_map() {
    let dir = tempdir().unwrap();
    let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();
    for i in 0..60 {
        map.put(&key(i), &value(i, 40)).unwrap();
    }

    let completed = map
        .for_each_remaining(|entry| {
            entry.remove()?;
            Ok(true)
        })
        .unwrap();
    assert!(completed);
    assert_eq!(map.len(), 0);
    for i in 0..map.segments() {
        let ctx = map.segment_context(i).unwrap();
        assert_eq!(ctx.segment().freelist().used_chunks(), 0);
    }
}

#[test]
fn test_hash_capacity_exhaustion_is_an_error_not_a_panic() {
    let dir = tempdir().unwrap();
    // A single segment with far more chunks than hash slots: the table
    // saturates first, and puts must surface SegmentFull.
    let config = MapConfig {
        chunk_size: 32,
        chunks_per_segment: 256,
        max_chunks_per_entry: 256,
        entries_per_segment: 32,
        actual_segments: 1,
        ..Default::default()
    };
    let map = SharedMap::create(&dir.path().join("m.stratum"), config).unwrap();
    let capacity = map.layout().capacity as u64;
    assert!((capacity as usize) < 256);

    let mut stored = 0u64;
    let mut full = false;
    for i in 0..1024 {
        match map.put(&key(i), b"v") {
            Ok(_) => stored += 1,
            Err(StratumError::SegmentFull { .. }) => {
                full = true;
                break;
            }
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert!(full);
    assert_eq!(stored, capacity - 1);
    assert_eq!(map.len(), capacity - 1);

    // The saturated segment still scans to completion.
    let mut visits = 0u64;
    map.for_each(|_, _| visits += 1).unwrap();
    assert_eq!(visits, capacity - 1);

    // Draining it leaves the segment genuinely empty again.
    map.retain(|_, _| false).unwrap();
    assert_eq!(map.len(), 0);
}

#[test]
fn test_clear_across_segments() {
    let dir = tempdir().unwrap();
    let map = SharedMap::create(&dir.path().join("m.stratum"), small_config()).unwrap();
    for i in 0..80 {
        map.put(&key(i), &value(i, 25)).unwrap();
    }
    assert_eq!(map.len(), 80);
    map.clear().unwrap();
    assert_eq!(map.len(), 0);
    assert_eq!(map.get(&key(3)).unwrap(), None);
}
