//! Shard
//!
//! One skip index, its log and its membership filter.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::filter::MembershipFilter;
use super::iterator::ShardIterator;
use crate::config::ShardOptions;
use crate::error::{Result, TierError};
use crate::format::{
    encode_record, lookup_key, InternalKeyComparator, RecordRef, SequenceNumber, ValueKind,
};
use crate::index::{AddOutcome, SkipIndex};
use crate::pmem::PersistentLog;

/// Result of a point lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Newest visible version holds this value
    Found(Bytes),
    /// Newest visible version is a deletion
    Deleted,
    /// No visible version in this shard
    NotFound,
}

impl Lookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    /// The value, if the lookup found one
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }
}

/// Backing files of one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFiles {
    pub index_path: PathBuf,
    pub log_path: PathBuf,
}

impl ShardFiles {
    pub fn new(index_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
            log_path: log_path.into(),
        }
    }
}

/// A hash-partitioned slice of the key space
///
/// ## Concurrency Model
/// - **Writes** (`add`): serialized by `write_lock`; log append, index link and
///   filter insert happen under it
/// - **Reads** (`get`, iterators): lock-free
///
/// Shards are shared as `Arc<Shard>`; files stay mapped while any clone (for
/// example one held by an iterator) is alive.
pub struct Shard {
    index: SkipIndex,
    log: Arc<PersistentLog>,
    filter: MembershipFilter,
    comparator: InternalKeyComparator,
    files: ShardFiles,

    index_file_id: AtomicU64,
    log_file_id: AtomicU64,

    /// Serializes write operations
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("index_file_id", &self.index_file_id)
            .field("log_file_id", &self.log_file_id)
            .finish_non_exhaustive()
    }
}

impl Shard {
    /// Create a shard over fresh files
    pub fn create(
        files: ShardFiles,
        options: &ShardOptions,
        comparator: InternalKeyComparator,
    ) -> Result<Self> {
        let log = Arc::new(PersistentLog::create(
            &files.log_path,
            options.log_region_size,
            options.log_growth_factor,
            options.persist_strategy,
        )?);
        let index = SkipIndex::create(&files.index_path, options, log.clone(), comparator.clone())?;
        let filter = MembershipFilter::new(options.filter_bits, options.filter_hash_count);

        info!("Created shard {:?} / {:?}", files.index_path, files.log_path);

        Ok(Self::from_parts(index, log, filter, comparator, files))
    }

    /// Reattach to existing files
    ///
    /// The filter starts untrusted; restore it from metadata or call
    /// [`Shard::rebuild_filter`] to let it reject keys again.
    pub fn recover(
        files: ShardFiles,
        options: &ShardOptions,
        comparator: InternalKeyComparator,
    ) -> Result<Self> {
        let log = Arc::new(PersistentLog::recover(
            &files.log_path,
            options.log_region_size,
            options.persist_strategy,
        )?);
        let index =
            SkipIndex::recover(&files.index_path, options, log.clone(), comparator.clone())?;
        let filter = MembershipFilter::untrusted(options.filter_bits, options.filter_hash_count);

        info!(
            "Recovered shard {:?}: {} entries, {} index bytes, {} log bytes",
            files.index_path,
            index.node_count(),
            index.memory_usage(),
            log.bytes_used()
        );

        Ok(Self::from_parts(index, log, filter, comparator, files))
    }

    fn from_parts(
        index: SkipIndex,
        log: Arc<PersistentLog>,
        filter: MembershipFilter,
        comparator: InternalKeyComparator,
        files: ShardFiles,
    ) -> Self {
        Self {
            index,
            log,
            filter,
            comparator,
            files,
            index_file_id: AtomicU64::new(0),
            log_file_id: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Add one encoded record (see [`crate::format::encode_record`])
    pub fn add(&self, record: &[u8]) -> Result<AddOutcome> {
        let decoded = RecordRef::decode(record)?;
        if decoded.encoded_len != record.len() {
            return Err(TierError::InvalidRecord(format!(
                "{} trailing bytes after record",
                record.len() - decoded.encoded_len
            )));
        }

        let _guard = self.write_lock.lock();

        let offset = self.log.append(record)?;
        let outcome = self
            .index
            .add(decoded.internal_key, offset, decoded.sequence)?;
        self.filter.insert(decoded.user_key());

        Ok(outcome)
    }

    pub fn put(&self, user_key: &[u8], sequence: SequenceNumber, value: &[u8]) -> Result<AddOutcome> {
        self.add(&encode_record(user_key, sequence, ValueKind::Value, value)?)
    }

    pub fn delete(&self, user_key: &[u8], sequence: SequenceNumber) -> Result<AddOutcome> {
        self.add(&encode_record(user_key, sequence, ValueKind::Deletion, &[])?)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Newest version of `user_key` with sequence ≤ `snapshot`
    pub fn get(&self, user_key: &[u8], snapshot: SequenceNumber) -> Result<Lookup> {
        if !self.filter.may_contain(user_key) {
            return Ok(Lookup::NotFound);
        }

        let target = lookup_key(user_key, snapshot);
        let Some(node) = self.index.seek(&target)? else {
            return Ok(Lookup::NotFound);
        };

        let record = self.log.read_record(self.index.payload(node))?;
        if self
            .comparator
            .user_comparator()
            .compare(record.user_key(), user_key)
            != Ordering::Equal
        {
            return Ok(Lookup::NotFound);
        }
        // Only reachable when a newer write overwrote the node in place.
        if record.sequence > snapshot {
            return Ok(Lookup::NotFound);
        }

        Ok(match record.kind {
            ValueKind::Value => Lookup::Found(Bytes::copy_from_slice(record.value)),
            ValueKind::Deletion => Lookup::Deleted,
        })
    }

    /// Cursor that keeps this shard alive until dropped
    pub fn new_iterator(self: &Arc<Self>) -> ShardIterator {
        ShardIterator::new(Arc::clone(self))
    }

    // =========================================================================
    // Filter
    // =========================================================================

    pub fn filter(&self) -> &MembershipFilter {
        &self.filter
    }

    /// Rebuild the filter from every key in the index and trust it again
    pub fn rebuild_filter(&self) -> Result<()> {
        let _guard = self.write_lock.lock();

        self.filter.set_trusted(false);
        self.filter.clear();
        let mut keys = 0usize;
        for offset in self.index.iter() {
            self.filter.insert(self.log.read_user_key(offset?)?);
            keys += 1;
        }
        self.filter.set_trusted(true);

        debug!("Rebuilt filter for {:?} from {} keys", self.files.index_path, keys);
        Ok(())
    }

    // =========================================================================
    // Stats & identity
    // =========================================================================

    pub fn index_bytes_used(&self) -> usize {
        self.index.memory_usage()
    }

    pub fn log_bytes_used(&self) -> usize {
        self.log.bytes_used()
    }

    pub fn entry_count(&self) -> u64 {
        self.index.node_count()
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.index.last_sequence()
    }

    pub fn set_partition_id(&self, index_file_id: u64, log_file_id: u64) {
        self.index_file_id.store(index_file_id, AtomicOrdering::Release);
        self.log_file_id.store(log_file_id, AtomicOrdering::Release);
    }

    pub fn index_file_id(&self) -> u64 {
        self.index_file_id.load(AtomicOrdering::Acquire)
    }

    pub fn log_file_id(&self) -> u64 {
        self.log_file_id.load(AtomicOrdering::Acquire)
    }

    pub fn files(&self) -> &ShardFiles {
        &self.files
    }

    pub fn index_path(&self) -> &Path {
        &self.files.index_path
    }

    pub fn log_path(&self) -> &Path {
        &self.files.log_path
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.comparator
    }

    pub(crate) fn index(&self) -> &SkipIndex {
        &self.index
    }

    pub(crate) fn log(&self) -> &PersistentLog {
        &self.log
    }

    /// Flush both regions in full
    pub fn sync(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.log.sync()?;
        self.index.arena().sync()
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        debug!("Releasing shard {:?}", self.files.index_path);
    }
}
