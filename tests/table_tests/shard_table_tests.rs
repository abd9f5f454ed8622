//! Tests for ShardTable
//!
//! These tests verify:
//! - Construction rules for the shard count
//! - Deterministic key routing
//! - Reads and writes through the table
//! - Atomic shard replacement
//! - Merged iteration across shards

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use nvtier::config::{OverwritePolicy, PersistStrategy, ShardOptions};
use nvtier::format::{extract_user_key, lookup_key, InternalKeyComparator, MAX_SEQUENCE};
use nvtier::shard::ShardFiles;
use nvtier::table::partition;
use nvtier::{EntryIterator, Lookup, Shard, ShardTable, TierError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const MIB: usize = 1024 * 1024;

fn options(region_size: usize, policy: OverwritePolicy) -> ShardOptions {
    ShardOptions {
        index_region_size: region_size,
        log_region_size: region_size,
        persist_strategy: PersistStrategy::OsManaged,
        overwrite_policy: policy,
        filter_bits: 16 * 1024,
        ..ShardOptions::default()
    }
}

fn new_shard(dir: &Path, id: u64, opts: &ShardOptions) -> Arc<Shard> {
    let files = ShardFiles::new(
        dir.join(format!("{:06}.idx", id)),
        dir.join(format!("{:06}.log", id)),
    );
    let shard = Shard::create(files, opts, InternalKeyComparator::bytewise()).unwrap();
    shard.set_partition_id(id, id);
    Arc::new(shard)
}

fn new_table(dir: &Path, count: usize, opts: &ShardOptions) -> ShardTable {
    let shards = (0..count as u64).map(|id| new_shard(dir, id, opts)).collect();
    ShardTable::new(shards, InternalKeyComparator::bytewise()).unwrap()
}

fn value_of(lookup: Lookup) -> Option<Bytes> {
    match lookup {
        Lookup::Found(value) => Some(value),
        _ => None,
    }
}

fn collect_forward(iter: &mut impl EntryIterator) -> Vec<String> {
    let mut keys = Vec::new();
    while iter.valid() {
        keys.push(String::from_utf8(extract_user_key(iter.key()).to_vec()).unwrap());
        iter.next().unwrap();
    }
    keys
}

// =============================================================================
// Construction & Routing Tests
// =============================================================================

#[test]
fn test_shard_count_must_be_power_of_two() {
    let temp = TempDir::new().unwrap();
    let opts = options(64 * 1024, OverwritePolicy::MultiVersion);

    let three = (0..3).map(|id| new_shard(temp.path(), id, &opts)).collect();
    let err = ShardTable::new(three, InternalKeyComparator::bytewise()).unwrap_err();
    assert!(matches!(err, TierError::Config(_)));

    let err = ShardTable::new(Vec::new(), InternalKeyComparator::bytewise()).unwrap_err();
    assert!(matches!(err, TierError::Config(_)));

    let one = vec![new_shard(temp.path(), 10, &opts)];
    let table = ShardTable::new(one, InternalKeyComparator::bytewise()).unwrap();
    assert_eq!(table.num_shards(), 1);
    assert_eq!(table.partition(b"anything"), 0);
}

#[test]
fn test_partition_is_deterministic_and_spread() {
    let mut counts = [0usize; 8];
    for i in 0..8000 {
        let key = format!("key{}", i);
        let shard = partition(key.as_bytes(), 8);
        assert!(shard < 8);
        assert_eq!(shard, partition(key.as_bytes(), 8));
        counts[shard] += 1;
    }
    for count in counts {
        assert!(count > 500, "uneven partitioning: {:?}", counts);
    }
}

#[test]
fn test_shard_out_of_range() {
    let temp = TempDir::new().unwrap();
    let table = new_table(temp.path(), 2, &options(64 * 1024, OverwritePolicy::MultiVersion));

    assert!(table.shard(1).is_ok());
    let err = table.shard(2).unwrap_err();
    assert!(matches!(err, TierError::InvalidShard { index: 2, count: 2 }));
}

// =============================================================================
// Read/Write Tests
// =============================================================================

#[test]
fn test_thousand_keys_across_four_shards() {
    let temp = TempDir::new().unwrap();
    let table = new_table(temp.path(), 4, &options(MIB, OverwritePolicy::MultiVersion));

    for i in 0..1000u64 {
        let key = format!("k{:04}", i);
        let value = format!("value-{:010}", i);
        assert_eq!(value.len(), 16);
        let shard = table.put(key.as_bytes(), i + 1, value.as_bytes()).unwrap();
        assert_eq!(shard, table.partition(key.as_bytes()));
    }

    for i in 0..1000u64 {
        let key = format!("k{:04}", i);
        let value = value_of(table.get(key.as_bytes(), 1000).unwrap()).unwrap();
        assert_eq!(value, format!("value-{:010}", i).as_bytes());
    }

    let total: u64 = table.shards().iter().map(|s| s.entry_count()).sum();
    assert_eq!(total, 1000);
    for shard in table.shards() {
        assert!(shard.entry_count() > 0);
    }
    assert!(table.shards_over_threshold(MIB, MIB).is_empty());
}

#[test]
fn test_table_snapshot_reads() {
    let temp = TempDir::new().unwrap();
    let table = new_table(temp.path(), 4, &options(MIB, OverwritePolicy::MultiVersion));

    table.put(b"a", 10, b"x").unwrap();
    table.delete(b"a", 20).unwrap();

    assert_eq!(value_of(table.get(b"a", 15).unwrap()).unwrap(), &b"x"[..]);
    assert_eq!(table.get(b"a", 25).unwrap(), Lookup::Deleted);
    assert_eq!(table.get(b"b", 25).unwrap(), Lookup::NotFound);
}

#[test]
fn test_table_latest_only() {
    let temp = TempDir::new().unwrap();
    let table = new_table(temp.path(), 4, &options(MIB, OverwritePolicy::LatestOnly));

    table.put(b"a", 10, b"x").unwrap();
    table.delete(b"a", 20).unwrap();

    assert_eq!(table.get(b"a", 15).unwrap(), Lookup::NotFound);
    assert_eq!(table.get(b"a", 25).unwrap(), Lookup::Deleted);
}

// =============================================================================
// Replacement Tests
// =============================================================================

#[test]
fn test_replace_full_shard() {
    let temp = TempDir::new().unwrap();
    let opts = options(64 * 1024, OverwritePolicy::MultiVersion);
    let table = new_table(temp.path(), 4, &opts);
    let index_limit = 8 * 1024;

    let mut written = Vec::new();
    let mut i = 0u64;
    while table.shard(0).unwrap().index_bytes_used() < index_limit {
        let key = format!("key{:05}", i);
        i += 1;
        if table.partition(key.as_bytes()) == 0 {
            table.put(key.as_bytes(), i, b"v").unwrap();
            written.push(key);
        }
    }

    let full = table.shards_over_threshold(index_limit, usize::MAX);
    assert_eq!(full.keys().copied().collect::<Vec<_>>(), vec![0]);

    let old = table.shard(0).unwrap();
    let mut replacements = BTreeMap::new();
    replacements.insert(0, new_shard(temp.path(), 100, &opts));
    let displaced = table.replace_shards(replacements).unwrap();

    assert!(Arc::ptr_eq(&displaced[&0], &old));
    assert_eq!(table.shard(0).unwrap().index_file_id(), 100);
    assert_eq!(table.shard(0).unwrap().entry_count(), 0);

    for key in &written {
        assert_eq!(table.get(key.as_bytes(), MAX_SEQUENCE).unwrap(), Lookup::NotFound);
        // The displaced shard still answers for holders of its Arc.
        assert!(old.get(key.as_bytes(), MAX_SEQUENCE).unwrap().is_found());
    }
    assert!(table.shards_over_threshold(index_limit, usize::MAX).is_empty());
}

#[test]
fn test_replace_rejects_invalid_index() {
    let temp = TempDir::new().unwrap();
    let opts = options(64 * 1024, OverwritePolicy::MultiVersion);
    let table = new_table(temp.path(), 2, &opts);
    let before = table.shard(0).unwrap();

    let mut replacements = BTreeMap::new();
    replacements.insert(0, new_shard(temp.path(), 50, &opts));
    replacements.insert(2, new_shard(temp.path(), 51, &opts));

    let err = table.replace_shards(replacements).unwrap_err();
    assert!(matches!(err, TierError::InvalidShard { index: 2, count: 2 }));
    // Nothing changed, not even the valid slot.
    assert!(Arc::ptr_eq(&table.shard(0).unwrap(), &before));
}

#[test]
fn test_iterator_survives_replacement() {
    let temp = TempDir::new().unwrap();
    let opts = options(64 * 1024, OverwritePolicy::MultiVersion);
    let table = new_table(temp.path(), 1, &opts);
    table.put(b"a", 1, b"1").unwrap();
    table.put(b"b", 2, b"2").unwrap();

    let mut iter = table.new_iterator();
    let mut replacements = BTreeMap::new();
    replacements.insert(0, new_shard(temp.path(), 9, &opts));
    drop(table.replace_shards(replacements).unwrap());

    iter.seek_to_first().unwrap();
    assert_eq!(collect_forward(&mut iter), vec!["a", "b"]);
}

// =============================================================================
// Merging Iterator Tests
// =============================================================================

fn populated_table(temp: &TempDir) -> (ShardTable, Vec<String>) {
    let table = new_table(temp.path(), 4, &options(MIB, OverwritePolicy::MultiVersion));
    let mut keys: Vec<String> = (0..200).map(|i| format!("key{:03}", (i * 71) % 200)).collect();
    for (seq, key) in keys.iter().enumerate() {
        table.put(key.as_bytes(), seq as u64 + 1, key.as_bytes()).unwrap();
    }
    keys.sort();
    (table, keys)
}

#[test]
fn test_merged_forward_scan() {
    let temp = TempDir::new().unwrap();
    let (table, expected) = populated_table(&temp);

    let mut iter = table.new_iterator();
    assert!(!iter.valid());
    iter.seek_to_first().unwrap();
    assert_eq!(collect_forward(&mut iter), expected);
}

#[test]
fn test_merged_backward_scan() {
    let temp = TempDir::new().unwrap();
    let (table, mut expected) = populated_table(&temp);
    expected.reverse();

    let mut iter = table.new_iterator();
    iter.seek_to_last().unwrap();
    let mut keys = Vec::new();
    while iter.valid() {
        assert_eq!(iter.value(), extract_user_key(iter.key()));
        keys.push(String::from_utf8(extract_user_key(iter.key()).to_vec()).unwrap());
        iter.prev().unwrap();
    }
    assert_eq!(keys, expected);
}

#[test]
fn test_merged_seek_and_direction_switch() {
    let temp = TempDir::new().unwrap();
    let (table, _) = populated_table(&temp);

    let mut iter = table.new_iterator();
    iter.seek(&lookup_key(b"key100", MAX_SEQUENCE)).unwrap();
    assert_eq!(extract_user_key(iter.key()), b"key100");

    iter.next().unwrap();
    assert_eq!(extract_user_key(iter.key()), b"key101");
    iter.prev().unwrap();
    assert_eq!(extract_user_key(iter.key()), b"key100");
    iter.prev().unwrap();
    assert_eq!(extract_user_key(iter.key()), b"key099");
    iter.next().unwrap();
    assert_eq!(extract_user_key(iter.key()), b"key100");
    iter.next().unwrap();
    assert_eq!(extract_user_key(iter.key()), b"key101");

    iter.seek(&lookup_key(b"zzz", MAX_SEQUENCE)).unwrap();
    assert!(!iter.valid());
}

#[test]
fn test_merged_iterator_interleaves_versions() {
    let temp = TempDir::new().unwrap();
    let table = new_table(temp.path(), 2, &options(MIB, OverwritePolicy::MultiVersion));
    table.put(b"k", 1, b"old").unwrap();
    table.put(b"k", 2, b"new").unwrap();
    table.put(b"j", 3, b"j").unwrap();

    let mut iter = table.new_iterator();
    iter.seek_to_first().unwrap();
    let mut values = Vec::new();
    while iter.valid() {
        values.push(iter.value().to_vec());
        iter.next().unwrap();
    }
    assert_eq!(values, vec![b"j".to_vec(), b"new".to_vec(), b"old".to_vec()]);
}
