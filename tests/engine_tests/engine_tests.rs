//! Tests for Engine
//!
//! These tests verify:
//! - Basic get/put/delete operations and sequence assignment
//! - Reattaching to a data directory (clean close and plain drop)
//! - Filter metadata across restarts
//! - Draining over-threshold shards
//! - Concurrent access patterns

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use nvtier::config::{Config, OverwritePolicy, PersistStrategy};
use nvtier::engine::Engine;
use nvtier::format::{extract_user_key, parse_internal_key, ValueKind};
use nvtier::{EntryIterator, Lookup, TierError};
use parking_lot::Mutex;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(dir: &Path) -> Config {
    Config::builder()
        .data_dir(dir)
        .num_shards(4)
        .index_region_size(256 * 1024)
        .log_region_size(1024 * 1024)
        .persist_strategy(PersistStrategy::OsManaged)
        .filter_bits(8192)
        .build()
}

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(temp_dir.path())).unwrap();
    (temp_dir, engine)
}

/// Engine that drains any shard holding at least one entry
fn setup_draining_engine(dir: &Path) -> Engine {
    let mut config = test_config(dir);
    config.log_drain_threshold = 1;
    Engine::open(config).unwrap()
}

fn some(value: &str) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(value.as_bytes()))
}

fn shard_file_count(engine: &Engine) -> usize {
    fs::read_dir(engine.shard_dir()).unwrap().count()
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_engine_open_creates_layout() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("mydb");

    let engine = Engine::open(test_config(&data_dir)).unwrap();

    assert!(data_dir.join("CATALOG").exists());
    assert!(data_dir.join("shards").is_dir());
    // One index and one log per shard.
    assert_eq!(shard_file_count(&engine), 8);
    assert_eq!(engine.table().num_shards(), 4);
    assert_eq!(engine.last_sequence(), 0);
}

#[test]
fn test_engine_put_get() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"hello", b"world").unwrap();
    assert_eq!(engine.get(b"hello").unwrap(), some("world"));
    assert_eq!(engine.get(b"nonexistent").unwrap(), None);
}

#[test]
fn test_engine_sequences_increase() {
    let (_temp, engine) = setup_temp_engine();

    let first = engine.put(b"a", b"1").unwrap();
    let second = engine.put(b"b", b"2").unwrap();
    let third = engine.delete(b"a").unwrap();

    assert_eq!(first, 1);
    assert_eq!(second, 2);
    assert_eq!(third, 3);
    assert_eq!(engine.last_sequence(), 3);
}

#[test]
fn test_engine_overwrite_and_delete() {
    let (_temp, engine) = setup_temp_engine();

    let v1 = engine.put(b"key", b"value1").unwrap();
    engine.put(b"key", b"value2").unwrap();
    assert_eq!(engine.get(b"key").unwrap(), some("value2"));

    engine.delete(b"key").unwrap();
    assert_eq!(engine.get(b"key").unwrap(), None);
    assert_eq!(engine.get_at(b"key", engine.last_sequence()).unwrap(), Lookup::Deleted);

    // Older versions stay visible to older snapshots.
    assert_eq!(
        engine.get_at(b"key", v1).unwrap(),
        Lookup::Found(Bytes::from_static(b"value1"))
    );
}

#[test]
fn test_engine_latest_only_policy() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = test_config(temp_dir.path());
    config.overwrite_policy = OverwritePolicy::LatestOnly;
    let engine = Engine::open(config).unwrap();

    let v1 = engine.put(b"key", b"value1").unwrap();
    engine.put(b"key", b"value2").unwrap();

    assert_eq!(engine.get(b"key").unwrap(), some("value2"));
    assert_eq!(engine.get_at(b"key", v1).unwrap(), Lookup::NotFound);
    let entries: u64 = engine.stats().iter().map(|s| s.entries).sum();
    assert_eq!(entries, 1);
}

#[test]
fn test_engine_iter_is_ordered() {
    let (_temp, engine) = setup_temp_engine();
    for key in ["delta", "alpha", "charlie", "bravo"] {
        engine.put(key.as_bytes(), key.to_uppercase().as_bytes()).unwrap();
    }
    engine.delete(b"charlie").unwrap();

    let mut iter = engine.iter();
    iter.seek_to_first().unwrap();
    let mut entries = Vec::new();
    while iter.valid() {
        let (user_key, _, kind) = parse_internal_key(iter.key()).unwrap();
        entries.push((String::from_utf8(user_key.to_vec()).unwrap(), kind));
        iter.next().unwrap();
    }

    assert_eq!(
        entries,
        vec![
            ("alpha".to_string(), ValueKind::Value),
            ("bravo".to_string(), ValueKind::Value),
            ("charlie".to_string(), ValueKind::Deletion),
            ("charlie".to_string(), ValueKind::Value),
            ("delta".to_string(), ValueKind::Value),
        ]
    );
}

// =============================================================================
// Restart Tests
// =============================================================================

#[test]
fn test_engine_close_and_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(test_config(temp_dir.path())).unwrap();
        for i in 0..100 {
            engine
                .put(format!("key{}", i).as_bytes(), format!("value{}", i).as_bytes())
                .unwrap();
        }
        engine.delete(b"key50").unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(test_config(temp_dir.path())).unwrap();
    assert_eq!(engine.last_sequence(), 101);
    for i in 0..100 {
        let expected = if i == 50 { None } else { some(&format!("value{}", i)) };
        assert_eq!(engine.get(format!("key{}", i).as_bytes()).unwrap(), expected);
    }
    // Filters came back from the metadata file.
    assert!(engine.stats().iter().all(|s| s.filter_trusted));
}

#[test]
fn test_engine_drop_without_close() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(test_config(temp_dir.path())).unwrap();
        for i in 0..50 {
            engine
                .put(format!("key{}", i).as_bytes(), format!("value{}", i).as_bytes())
                .unwrap();
        }
        // Dropped without close: no metadata, catalog still says sequence 0.
    }

    let engine = Engine::open(test_config(temp_dir.path())).unwrap();
    assert_eq!(engine.last_sequence(), 50);
    assert!(engine.stats().iter().all(|s| !s.filter_trusted));
    for i in 0..50 {
        assert_eq!(
            engine.get(format!("key{}", i).as_bytes()).unwrap(),
            some(&format!("value{}", i))
        );
    }

    assert_eq!(engine.put(b"next", b"v").unwrap(), 51);
}

#[test]
fn test_engine_writes_after_restore_invalidate_slot() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(test_config(temp_dir.path())).unwrap();
        engine.put(b"before", b"1").unwrap();
        engine.close().unwrap();
    }

    let late_shard;
    {
        let engine = Engine::open(test_config(temp_dir.path())).unwrap();
        late_shard = engine.table().partition(b"after");
        engine.put(b"after", b"2").unwrap();
        // Dropped: the saved filter for that slot is now stale.
    }

    let engine = Engine::open(test_config(temp_dir.path())).unwrap();
    let stats = engine.stats();
    assert!(!stats[late_shard].filter_trusted);
    assert_eq!(stats.iter().filter(|s| s.filter_trusted).count(), 3);
    assert_eq!(engine.get(b"after").unwrap(), some("2"));
    assert_eq!(engine.get(b"before").unwrap(), some("1"));
}

#[test]
fn test_engine_shard_count_mismatch() {
    let temp_dir = TempDir::new().unwrap();
    Engine::open(test_config(temp_dir.path()))
        .unwrap()
        .close()
        .unwrap();

    let mut config = test_config(temp_dir.path());
    config.num_shards = 8;
    let result = Engine::open(config);
    assert!(matches!(result, Err(TierError::Config(_))));
}

#[test]
fn test_engine_overwrite_policy_mismatch() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(test_config(temp_dir.path())).unwrap();
        engine.put(b"a", b"x").unwrap();
        engine.delete(b"a").unwrap();
        engine.close().unwrap();
    }

    let mut config = test_config(temp_dir.path());
    config.overwrite_policy = OverwritePolicy::LatestOnly;
    let result = Engine::open(config);
    assert!(matches!(result, Err(TierError::Config(_))));

    // The directory is untouched and still answers old snapshots.
    let engine = Engine::open(test_config(temp_dir.path())).unwrap();
    assert_eq!(engine.get_at(b"a", 1).unwrap(), Lookup::Found(Bytes::from_static(b"x")));
    assert_eq!(engine.get(b"a").unwrap(), None);
}

#[test]
fn test_engine_rejects_invalid_config() {
    let temp_dir = TempDir::new().unwrap();

    let mut config = test_config(temp_dir.path());
    config.num_shards = 3;
    assert!(matches!(Engine::open(config), Err(TierError::Config(_))));

    let mut config = test_config(temp_dir.path());
    config.index_growth_factor = 0.5;
    assert!(matches!(Engine::open(config), Err(TierError::Config(_))));

    let mut config = test_config(temp_dir.path());
    config.filter_bits = 100;
    assert!(matches!(Engine::open(config), Err(TierError::Config(_))));
}

#[test]
fn test_engine_removes_orphaned_files() {
    let temp_dir = TempDir::new().unwrap();
    Engine::open(test_config(temp_dir.path()))
        .unwrap()
        .close()
        .unwrap();

    let orphan = temp_dir.path().join("shards").join("000999.idx");
    fs::write(&orphan, b"left over from an interrupted drain").unwrap();

    let engine = Engine::open(test_config(temp_dir.path())).unwrap();
    assert!(!orphan.exists());
    assert_eq!(shard_file_count(&engine), 8);
}

#[test]
fn test_engine_open_path_convenience() {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open_path(temp_dir.path()).unwrap();

    assert_eq!(engine.data_dir(), temp_dir.path());
    assert_eq!(engine.config().num_shards, Config::default().num_shards);
    engine.put(b"key", b"value").unwrap();
    assert_eq!(engine.get(b"key").unwrap(), some("value"));
}

// =============================================================================
// Drain Tests
// =============================================================================

#[test]
fn test_engine_drain_hands_off_entries() {
    let temp_dir = TempDir::new().unwrap();
    let engine = setup_draining_engine(temp_dir.path());
    for i in 0..200 {
        engine
            .put(format!("key{:03}", i).as_bytes(), format!("value{}", i).as_bytes())
            .unwrap();
    }
    let old_files: Vec<_> = engine
        .table()
        .shards()
        .iter()
        .flat_map(|s| [s.index_path().to_path_buf(), s.log_path().to_path_buf()])
        .collect();

    let seen = Mutex::new(Vec::new());
    let drained = engine
        .drain(|index, iter| {
            while iter.valid() {
                let key = String::from_utf8(extract_user_key(iter.key()).to_vec()).unwrap();
                seen.lock().push((index, key));
                iter.next()?;
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(drained.len(), 4);
    assert_eq!(drained.iter().map(|d| d.entries).sum::<u64>(), 200);

    let mut seen = seen.into_inner();
    assert_eq!(seen.len(), 200);
    for (index, key) in &seen {
        assert_eq!(engine.table().partition(key.as_bytes()), *index);
    }
    seen.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(seen[0].1, "key000");

    // Drained data left the tier, and so did its files.
    assert_eq!(engine.get(b"key000").unwrap(), None);
    assert!(engine.stats().iter().all(|s| s.entries == 0));
    for path in &old_files {
        assert!(!path.exists(), "{:?} should be deleted", path);
    }
    assert_eq!(shard_file_count(&engine), 8);

    // Sequences keep increasing across a drain.
    assert_eq!(engine.put(b"fresh", b"v").unwrap(), 201);
}

#[test]
fn test_engine_drain_failure_replaces_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let engine = setup_draining_engine(temp_dir.path());
    for i in 0..40 {
        engine.put(format!("key{}", i).as_bytes(), b"v").unwrap();
    }
    let failing = engine.table().partition(b"key7");
    let before: Vec<_> = engine.table().shards();

    let result = engine.drain(|index, _iter| {
        if index == failing {
            Err(TierError::Config("sink unavailable".to_string()))
        } else {
            Ok(())
        }
    });

    match result {
        Err(TierError::Drain { shard, .. }) => assert_eq!(shard, failing),
        other => panic!("expected drain error, got {:?}", other.map(|d| d.len())),
    }
    for (i, shard) in engine.table().shards().iter().enumerate() {
        assert!(Arc::ptr_eq(shard, &before[i]));
        assert!(shard.index_path().exists());
    }
    for i in 0..40 {
        assert_eq!(engine.get(format!("key{}", i).as_bytes()).unwrap(), some("v"));
    }
}

#[test]
fn test_engine_drain_nothing_over_threshold() {
    let (_temp, engine) = setup_temp_engine();
    engine.put(b"key", b"value").unwrap();

    let drained = engine.drain(|_, _| panic!("no shard should be drained")).unwrap();
    assert!(drained.is_empty());
    assert_eq!(engine.get(b"key").unwrap(), some("value"));
}

#[test]
fn test_engine_drain_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let engine = setup_draining_engine(temp_dir.path());
        engine.put(b"drained", b"v").unwrap();
        engine.drain(|_, _| Ok(())).unwrap();
        engine.put(b"kept", b"v").unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(test_config(temp_dir.path())).unwrap();
    assert_eq!(engine.get(b"drained").unwrap(), None);
    assert_eq!(engine.get(b"kept").unwrap(), some("v"));
    assert_eq!(engine.last_sequence(), 2);
}

// =============================================================================
// Concurrent Access Tests
// =============================================================================

#[test]
fn test_engine_concurrent_reads() {
    let (_temp, engine) = setup_temp_engine();
    let engine = Arc::new(engine);

    for i in 0..100 {
        engine
            .put(format!("key{}", i).as_bytes(), format!("value{}", i).as_bytes())
            .unwrap();
    }

    let mut handles = vec![];
    for _ in 0..4 {
        let engine_clone = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            for i in 0..100 {
                let key = format!("key{}", i);
                let result = engine_clone.get(key.as_bytes()).unwrap();
                assert_eq!(result, some(&format!("value{}", i)));
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_engine_concurrent_writes() {
    let (_temp, engine) = setup_temp_engine();
    let engine = Arc::new(engine);

    let mut handles = vec![];
    for t in 0..4 {
        let engine_clone = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            for i in 0..25 {
                let key = format!("thread{}_key{}", t, i);
                let value = format!("thread{}_value{}", t, i);
                engine_clone.put(key.as_bytes(), value.as_bytes()).unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.last_sequence(), 100);
    for t in 0..4 {
        for i in 0..25 {
            let key = format!("thread{}_key{}", t, i);
            let expected = format!("thread{}_value{}", t, i);
            assert_eq!(engine.get(key.as_bytes()).unwrap(), some(&expected));
        }
    }
}

// =============================================================================
// Edge Cases
// =============================================================================

#[test]
fn test_engine_empty_key_and_value() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"", b"empty_key_value").unwrap();
    engine.put(b"key", b"").unwrap();
    assert_eq!(engine.get(b"").unwrap(), some("empty_key_value"));
    assert_eq!(engine.get(b"key").unwrap(), some(""));
}

#[test]
fn test_engine_large_value() {
    let (_temp, engine) = setup_temp_engine();

    let large_value = vec![0xAB; 100_000];
    engine.put(b"large_key", &large_value).unwrap();

    let result = engine.get(b"large_key").unwrap();
    assert_eq!(result, Some(Bytes::from(large_value)));
}

#[test]
fn test_engine_binary_data() {
    let (_temp, engine) = setup_temp_engine();

    let key = b"\x00\x01\x02\xFF\xFE";
    let value = b"\xFF\x00\xAB\xCD\x00";

    engine.put(key, value).unwrap();
    assert_eq!(engine.get(key).unwrap(), Some(Bytes::copy_from_slice(value)));
}
