//! Tests for the filter metadata file
//!
//! These tests verify:
//! - Filters saved on one open are restored on the next
//! - Slots whose shard changed after the save are skipped
//! - Damaged files are reported as corruption

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nvtier::config::{PersistStrategy, ShardOptions};
use nvtier::format::InternalKeyComparator;
use nvtier::shard::ShardFiles;
use nvtier::{Shard, ShardTable, TierError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn options() -> ShardOptions {
    ShardOptions {
        index_region_size: 128 * 1024,
        log_region_size: 128 * 1024,
        persist_strategy: PersistStrategy::OsManaged,
        filter_bits: 4096,
        ..ShardOptions::default()
    }
}

fn shard_files(dir: &Path, id: u64) -> ShardFiles {
    ShardFiles::new(
        dir.join(format!("{:06}.idx", id)),
        dir.join(format!("{:06}.log", id)),
    )
}

fn open_table(dir: &Path, count: u64, fresh: bool) -> ShardTable {
    let shards = (0..count)
        .map(|id| {
            let files = shard_files(dir, id);
            let shard = if fresh {
                Shard::create(files, &options(), InternalKeyComparator::bytewise())
            } else {
                Shard::recover(files, &options(), InternalKeyComparator::bytewise())
            }
            .unwrap();
            shard.set_partition_id(id + 100, id + 200);
            Arc::new(shard)
        })
        .collect();
    ShardTable::new(shards, InternalKeyComparator::bytewise()).unwrap()
}

fn meta_path(dir: &Path) -> PathBuf {
    dir.join("filters.meta")
}

/// Table with 4 shards, 200 keys, and its filters saved
fn saved_table(dir: &Path) {
    let table = open_table(dir, 4, true);
    for i in 0..200u64 {
        table.put(format!("key{:03}", i).as_bytes(), i + 1, b"v").unwrap();
    }
    table.save_metadata(&meta_path(dir)).unwrap();
}

fn trusted_count(table: &ShardTable) -> usize {
    table
        .shards()
        .iter()
        .filter(|s| s.filter().is_trusted())
        .count()
}

// =============================================================================
// Save/Recover Tests
// =============================================================================

#[test]
fn test_filters_survive_restart() {
    let temp = TempDir::new().unwrap();
    saved_table(temp.path());

    let table = open_table(temp.path(), 4, false);
    assert_eq!(trusted_count(&table), 0);

    let restored = table.recover_metadata(&meta_path(temp.path())).unwrap();
    assert_eq!(restored, 4);
    assert_eq!(trusted_count(&table), 4);

    for i in 0..200u64 {
        let key = format!("key{:03}", i);
        let shard = table.shard(table.partition(key.as_bytes())).unwrap();
        assert!(shard.filter().may_contain(key.as_bytes()));
        assert!(table.get(key.as_bytes(), 1000).unwrap().is_found());
    }
}

#[test]
fn test_write_after_save_makes_slot_stale() {
    let temp = TempDir::new().unwrap();
    saved_table(temp.path());

    let stale_shard;
    {
        let table = open_table(temp.path(), 4, false);
        stale_shard = table.put(b"late-write", 1000, b"v").unwrap();
    }

    let table = open_table(temp.path(), 4, false);
    let restored = table.recover_metadata(&meta_path(temp.path())).unwrap();
    assert_eq!(restored, 3);
    assert!(!table.shard(stale_shard).unwrap().filter().is_trusted());

    // The untrusted filter must not hide the late write.
    assert!(table.get(b"late-write", 1000).unwrap().is_found());
}

#[test]
fn test_file_id_mismatch_is_skipped() {
    let temp = TempDir::new().unwrap();
    saved_table(temp.path());

    let table = open_table(temp.path(), 4, false);
    table.shard(1).unwrap().set_partition_id(7, 7);

    assert_eq!(table.recover_metadata(&meta_path(temp.path())).unwrap(), 3);
    assert!(!table.shard(1).unwrap().filter().is_trusted());
}

#[test]
fn test_save_rebuilds_untrusted_filters() {
    let temp = TempDir::new().unwrap();
    saved_table(temp.path());

    // Reopen without restoring, then save again: every slot must be complete.
    {
        let table = open_table(temp.path(), 4, false);
        table.save_metadata(&meta_path(temp.path())).unwrap();
        assert_eq!(trusted_count(&table), 4);
    }

    let table = open_table(temp.path(), 4, false);
    assert_eq!(table.recover_metadata(&meta_path(temp.path())).unwrap(), 4);
    for i in 0..200u64 {
        let key = format!("key{:03}", i);
        let shard = table.shard(table.partition(key.as_bytes())).unwrap();
        assert!(shard.filter().may_contain(key.as_bytes()));
    }
}

#[test]
fn test_missing_file_restores_nothing() {
    let temp = TempDir::new().unwrap();
    let table = open_table(temp.path(), 2, true);

    assert_eq!(table.recover_metadata(&meta_path(temp.path())).unwrap(), 0);
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_flipped_byte_is_corruption() {
    let temp = TempDir::new().unwrap();
    saved_table(temp.path());

    let path = meta_path(temp.path());
    let mut bytes = fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xff;
    fs::write(&path, &bytes).unwrap();

    let table = open_table(temp.path(), 4, false);
    let err = table.recover_metadata(&path).unwrap_err();
    assert!(matches!(err, TierError::Corruption(_)));
    assert_eq!(trusted_count(&table), 0);
}

#[test]
fn test_truncated_file_is_corruption() {
    let temp = TempDir::new().unwrap();
    saved_table(temp.path());

    let path = meta_path(temp.path());
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..10]).unwrap();

    let table = open_table(temp.path(), 4, false);
    let err = table.recover_metadata(&path).unwrap_err();
    assert!(matches!(err, TierError::Corruption(_)));
}

#[test]
fn test_shard_count_mismatch_is_corruption() {
    let temp = TempDir::new().unwrap();
    saved_table(temp.path());

    let table = open_table(temp.path(), 2, false);
    let err = table.recover_metadata(&meta_path(temp.path())).unwrap_err();
    assert!(matches!(err, TierError::Corruption(_)));
}
