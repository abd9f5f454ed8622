//! Shard Table
//!
//! Fixed set of shards; every user key belongs to exactly one of them.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::merge::MergingIterator;
use super::{metadata, partition};
use crate::config::MAX_SHARDS;
use crate::error::{Result, TierError};
use crate::format::{encode_record, InternalKeyComparator, RecordRef, SequenceNumber, ValueKind};
use crate::shard::{Lookup, Shard};

/// Hash-partitioned collection of shards
///
/// ## Concurrency Model
/// - `add` holds the slot read lock for the whole write, so a concurrent
///   `replace_shards` cannot strand a record in a displaced shard
/// - `get` and iterators clone the `Arc<Shard>` out and release the lock
/// - `replace_shards` swaps every slot under one write lock
pub struct ShardTable {
    shards: RwLock<Vec<Arc<Shard>>>,
    comparator: InternalKeyComparator,
    num_shards: usize,
}

impl std::fmt::Debug for ShardTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardTable")
            .field("num_shards", &self.num_shards)
            .finish_non_exhaustive()
    }
}

impl ShardTable {
    /// Build a table over `shards`; the count must be a power of two
    pub fn new(shards: Vec<Arc<Shard>>, comparator: InternalKeyComparator) -> Result<Self> {
        let num_shards = shards.len();
        if num_shards == 0 || !num_shards.is_power_of_two() || num_shards > MAX_SHARDS {
            return Err(TierError::Config(format!(
                "shard table needs a power-of-two shard count up to {}, got {}",
                MAX_SHARDS, num_shards
            )));
        }

        info!("Opened shard table with {} shards", num_shards);

        Ok(Self {
            shards: RwLock::new(shards),
            comparator,
            num_shards,
        })
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.comparator
    }

    /// Shard index that owns `user_key`
    pub fn partition(&self, user_key: &[u8]) -> usize {
        partition::partition(user_key, self.num_shards)
    }

    pub fn shard(&self, index: usize) -> Result<Arc<Shard>> {
        self.shards
            .read()
            .get(index)
            .cloned()
            .ok_or(TierError::InvalidShard {
                index,
                count: self.num_shards,
            })
    }

    /// Snapshot of the current shard slots
    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.shards.read().clone()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Route one encoded record to its shard; returns the shard index
    pub fn add(&self, record: &[u8]) -> Result<usize> {
        let decoded = RecordRef::decode(record)?;
        let index = self.partition(decoded.user_key());

        let shards = self.shards.read();
        shards[index].add(record)?;
        Ok(index)
    }

    pub fn put(&self, user_key: &[u8], sequence: SequenceNumber, value: &[u8]) -> Result<usize> {
        self.add(&encode_record(user_key, sequence, ValueKind::Value, value)?)
    }

    pub fn delete(&self, user_key: &[u8], sequence: SequenceNumber) -> Result<usize> {
        self.add(&encode_record(user_key, sequence, ValueKind::Deletion, &[])?)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look `user_key` up in the one shard that can hold it
    pub fn get(&self, user_key: &[u8], snapshot: SequenceNumber) -> Result<Lookup> {
        let shard = self.shard(self.partition(user_key))?;
        shard.get(user_key, snapshot)
    }

    /// Ordered cursor over every shard
    pub fn new_iterator(&self) -> MergingIterator {
        let children = self
            .shards
            .read()
            .iter()
            .map(|shard| shard.new_iterator())
            .collect();
        MergingIterator::new(children, self.comparator.clone())
    }

    // =========================================================================
    // Drain support
    // =========================================================================

    /// Shards whose index or log usage reached the given limits
    pub fn shards_over_threshold(
        &self,
        index_limit: usize,
        log_limit: usize,
    ) -> BTreeMap<usize, Arc<Shard>> {
        self.shards
            .read()
            .iter()
            .enumerate()
            .filter(|(_, shard)| {
                shard.index_bytes_used() >= index_limit || shard.log_bytes_used() >= log_limit
            })
            .map(|(index, shard)| (index, Arc::clone(shard)))
            .collect()
    }

    /// Swap in new shards; returns the displaced ones
    ///
    /// Every index is validated before anything changes, and all slots change
    /// under one write lock. Displaced shards are released once the caller and
    /// any iterators drop them.
    pub fn replace_shards(
        &self,
        replacements: BTreeMap<usize, Arc<Shard>>,
    ) -> Result<BTreeMap<usize, Arc<Shard>>> {
        if let Some(&index) = replacements.keys().find(|&&i| i >= self.num_shards) {
            return Err(TierError::InvalidShard {
                index,
                count: self.num_shards,
            });
        }

        let mut shards = self.shards.write();
        let displaced = replacements
            .into_iter()
            .map(|(index, shard)| (index, std::mem::replace(&mut shards[index], shard)))
            .collect::<BTreeMap<_, _>>();

        info!("Replaced {} shards", displaced.len());
        Ok(displaced)
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Persist every shard's membership filter to `path`
    pub fn save_metadata(&self, path: &Path) -> Result<()> {
        metadata::save(path, &self.shards())
    }

    /// Restore filters saved by `save_metadata`; returns how many matched
    pub fn recover_metadata(&self, path: &Path) -> Result<usize> {
        metadata::recover(path, &self.shards())
    }

    /// Flush every shard's regions in full
    pub fn sync(&self) -> Result<()> {
        for shard in self.shards() {
            shard.sync()?;
        }
        Ok(())
    }
}
