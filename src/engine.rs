//! Engine Module
//!
//! Owns one data directory and the shard table inside it.
//!
//! ## Responsibilities
//! - Create or reattach every shard on startup (no log replay)
//! - Assign sequence numbers to writes
//! - Drain over-threshold shards in parallel and swap in fresh ones
//! - Save filters and the catalog on close

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogState, ShardEntry};
use crate::config::Config;
use crate::error::{Result, TierError};
use crate::format::{InternalKeyComparator, SequenceNumber, MAX_SEQUENCE};
use crate::iterator::EntryIterator;
use crate::shard::{Lookup, Shard, ShardFiles, ShardIterator};
use crate::table::{MergingIterator, ShardTable};

/// Usage figures for one shard slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
    pub index: usize,
    pub entries: u64,
    pub index_bytes: usize,
    pub log_bytes: usize,
    pub filter_trusted: bool,
}

/// One shard handed to a drain sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainedShard {
    pub index: usize,
    pub entries: u64,
    pub index_bytes: usize,
    pub log_bytes: usize,
}

/// The persistent write tier
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
///
/// - **Writes** (put/delete/drain): serialized by `write_lock`, which also
///   makes sequence assignment monotonic
/// - **Reads** (get/iter): lock-free down to the skip index
pub struct Engine {
    /// Engine configuration
    config: Config,

    /// Directory holding every index and log file
    shard_dir: PathBuf,

    table: Arc<ShardTable>,

    /// File ids per slot plus the id allocator
    catalog: Mutex<CatalogState>,

    /// Highest sequence number assigned so far
    last_sequence: AtomicU64,

    /// Serializes write operations (put/delete/drain)
    write_lock: Mutex<()>,
}

impl Engine {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const CATALOG_FILENAME: &'static str = "CATALOG";
    const FILTER_FILENAME: &'static str = "filters.meta";
    const SHARD_DIR: &'static str = "shards";

    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 1. Validate config and create directories
    /// 2. Load the catalog, or create fresh shards and write one
    /// 3. Reattach every shard from its persisted headers
    /// 4. Restore filters whose fingerprint still matches
    /// 5. Remove files no catalog entry refers to
    pub fn open(config: Config) -> Result<Self> {
        // Step 1: Validate and lay out the directory
        config.validate()?;
        let shard_dir = config.data_dir.join(Self::SHARD_DIR);
        fs::create_dir_all(&shard_dir)?;

        let catalog_path = config.data_dir.join(Self::CATALOG_FILENAME);
        let comparator = InternalKeyComparator::bytewise();
        let options = config.shard_options();

        // Step 2 + 3: Reattach or create
        let (catalog, shards) = match CatalogState::load(&catalog_path)? {
            Some(catalog) => {
                if catalog.shards.len() != config.num_shards {
                    return Err(TierError::Config(format!(
                        "data directory has {} shards, config asks for {}",
                        catalog.shards.len(),
                        config.num_shards
                    )));
                }
                if catalog.overwrite_policy != config.overwrite_policy {
                    return Err(TierError::Config(format!(
                        "data directory was built with {:?}, config asks for {:?}",
                        catalog.overwrite_policy, config.overwrite_policy
                    )));
                }

                let mut shards = Vec::with_capacity(catalog.shards.len());
                for entry in &catalog.shards {
                    let files = Self::shard_files(&shard_dir, entry);
                    let shard = Shard::recover(files, &options, comparator.clone())?;
                    shard.set_partition_id(entry.index_file_id, entry.log_file_id);
                    shards.push(Arc::new(shard));
                }
                (catalog, shards)
            }
            None => {
                let mut catalog = CatalogState::new(config.overwrite_policy);
                let mut shards = Vec::with_capacity(config.num_shards);
                for _ in 0..config.num_shards {
                    let (entry, shard) =
                        Self::create_shard(&shard_dir, &mut catalog, &config, &comparator)?;
                    catalog.shards.push(entry);
                    shards.push(shard);
                }
                catalog.store(&catalog_path)?;
                (catalog, shards)
            }
        };

        let table = Arc::new(ShardTable::new(shards, comparator)?);

        // Step 4: Filters
        let restored = table.recover_metadata(&config.data_dir.join(Self::FILTER_FILENAME))?;
        debug!("Restored {} of {} shard filters", restored, table.num_shards());

        let last_sequence = table
            .shards()
            .iter()
            .map(|shard| shard.last_sequence())
            .max()
            .unwrap_or(0)
            .max(catalog.last_sequence);

        // Step 5: Leftovers from an interrupted drain
        Self::remove_orphans(&shard_dir, &catalog)?;

        info!(
            "Opened engine at {:?}: {} shards, last sequence {}",
            config.data_dir,
            table.num_shards(),
            last_sequence
        );

        Ok(Self {
            config,
            shard_dir,
            table,
            catalog: Mutex::new(catalog),
            last_sequence: AtomicU64::new(last_sequence),
            write_lock: Mutex::new(()),
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = Config {
            data_dir: path.to_path_buf(),
            ..Config::default()
        };
        Self::open(config)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Put a key-value pair; returns the sequence number assigned
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<SequenceNumber> {
        let _write_guard = self.write_lock.lock();

        let sequence = self.next_sequence()?;
        self.table.put(key, sequence, value)?;
        self.last_sequence.store(sequence, Ordering::Release);
        Ok(sequence)
    }

    /// Record a deletion of `key`; returns the sequence number assigned
    pub fn delete(&self, key: &[u8]) -> Result<SequenceNumber> {
        let _write_guard = self.write_lock.lock();

        let sequence = self.next_sequence()?;
        self.table.delete(key, sequence)?;
        self.last_sequence.store(sequence, Ordering::Release);
        Ok(sequence)
    }

    fn next_sequence(&self) -> Result<SequenceNumber> {
        let sequence = self.last_sequence.load(Ordering::Acquire) + 1;
        if sequence > MAX_SEQUENCE {
            return Err(TierError::InvalidRecord(
                "sequence numbers exhausted".to_string(),
            ));
        }
        Ok(sequence)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Latest value of `key`, `None` if absent or deleted
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        match self.get_at(key, self.last_sequence())? {
            Lookup::Found(value) => Ok(Some(value)),
            Lookup::Deleted | Lookup::NotFound => Ok(None),
        }
    }

    /// Newest version of `key` visible at `snapshot`
    pub fn get_at(&self, key: &[u8], snapshot: SequenceNumber) -> Result<Lookup> {
        self.table.get(key, snapshot)
    }

    /// Ordered cursor over every shard (internal keys)
    pub fn iter(&self) -> MergingIterator {
        self.table.new_iterator()
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence.load(Ordering::Acquire)
    }

    // =========================================================================
    // Drain
    // =========================================================================

    /// Hand every over-threshold shard to `sink`, then replace it with an
    /// empty one
    ///
    /// Sinks run in parallel, one scoped thread per shard, each with its own
    /// iterator positioned at the first entry. If any sink fails nothing is
    /// replaced.
    pub fn drain<F>(&self, sink: F) -> Result<Vec<DrainedShard>>
    where
        F: Fn(usize, &mut ShardIterator) -> Result<()> + Sync,
    {
        let _write_guard = self.write_lock.lock();

        let over = self.table.shards_over_threshold(
            self.config.index_drain_threshold,
            self.config.log_drain_threshold,
        );
        if over.is_empty() {
            return Ok(Vec::new());
        }
        info!("Draining {} shards: {:?}", over.len(), over.keys().collect::<Vec<_>>());

        // Step 1: Run sinks in parallel
        let results = crossbeam::scope(|scope| {
            let handles: Vec<_> = over
                .iter()
                .map(|(&index, shard)| {
                    let sink = &sink;
                    let handle = scope.spawn(move |_| -> Result<()> {
                        let mut iter = shard.new_iterator();
                        iter.seek_to_first()?;
                        sink(index, &mut iter)
                    });
                    (index, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(index, handle)| {
                    let outcome = handle.join().unwrap_or_else(|_| {
                        Err(TierError::Drain {
                            shard: index,
                            reason: "drain worker panicked".to_string(),
                        })
                    });
                    (index, outcome)
                })
                .collect::<Vec<_>>()
        })
        .map_err(|_| TierError::DrainAborted("drain scope panicked".to_string()))?;

        for (index, outcome) in results {
            outcome.map_err(|e| match e {
                TierError::Drain { .. } | TierError::DrainAborted(_) => e,
                other => TierError::Drain {
                    shard: index,
                    reason: other.to_string(),
                },
            })?;
        }

        // Step 2: Fresh shards for every drained slot
        let mut catalog = self.catalog.lock();
        let mut next_catalog = catalog.clone();
        let mut replacements = BTreeMap::new();
        for &index in over.keys() {
            let (entry, shard) = Self::create_shard(
                &self.shard_dir,
                &mut next_catalog,
                &self.config,
                self.table.comparator(),
            )?;
            next_catalog.shards[index] = entry;
            replacements.insert(index, shard);
        }

        // Step 3: Swap, then make the swap durable
        let displaced = self.table.replace_shards(replacements)?;
        next_catalog.last_sequence = self.last_sequence();
        next_catalog.store(&self.config.data_dir.join(Self::CATALOG_FILENAME))?;
        *catalog = next_catalog;

        // Step 4: Old files are unreferenced now
        let report = displaced
            .iter()
            .map(|(&index, shard)| DrainedShard {
                index,
                entries: shard.entry_count(),
                index_bytes: shard.index_bytes_used(),
                log_bytes: shard.log_bytes_used(),
            })
            .collect();
        for shard in displaced.values() {
            Self::remove_file(shard.index_path());
            Self::remove_file(shard.log_path());
        }

        info!("Drain complete");
        Ok(report)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close the engine gracefully
    ///
    /// Flushes both regions of every shard, saves filters and the catalog.
    pub fn close(self) -> Result<()> {
        let _write_guard = self.write_lock.lock();

        self.table.sync()?;
        self.table
            .save_metadata(&self.config.data_dir.join(Self::FILTER_FILENAME))?;

        let mut catalog = self.catalog.lock();
        catalog.last_sequence = self.last_sequence();
        catalog.store(&self.config.data_dir.join(Self::CATALOG_FILENAME))?;

        info!("Closed engine at {:?}", self.config.data_dir);
        Ok(())
    }

    fn create_shard(
        shard_dir: &Path,
        catalog: &mut CatalogState,
        config: &Config,
        comparator: &InternalKeyComparator,
    ) -> Result<(ShardEntry, Arc<Shard>)> {
        let entry = ShardEntry {
            index_file_id: catalog.allocate_file_id(),
            log_file_id: catalog.allocate_file_id(),
        };
        let files = Self::shard_files(shard_dir, &entry);
        let shard = Shard::create(files, &config.shard_options(), comparator.clone())?;
        shard.set_partition_id(entry.index_file_id, entry.log_file_id);
        Ok((entry, Arc::new(shard)))
    }

    fn shard_files(shard_dir: &Path, entry: &ShardEntry) -> ShardFiles {
        ShardFiles::new(
            shard_dir.join(format!("{:06}.idx", entry.index_file_id)),
            shard_dir.join(format!("{:06}.log", entry.log_file_id)),
        )
    }

    fn remove_orphans(shard_dir: &Path, catalog: &CatalogState) -> Result<()> {
        let live: HashSet<PathBuf> = catalog
            .shards
            .iter()
            .flat_map(|entry| {
                let files = Self::shard_files(shard_dir, entry);
                [files.index_path, files.log_path]
            })
            .collect();

        for dir_entry in fs::read_dir(shard_dir)? {
            let path = dir_entry?.path();
            if path.is_file() && !live.contains(&path) {
                debug!("Removing orphaned shard file {:?}", path);
                Self::remove_file(&path);
            }
        }
        Ok(())
    }

    fn remove_file(path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {:?}: {}", path, e);
            }
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Get the directory holding the shard files
    pub fn shard_dir(&self) -> &Path {
        &self.shard_dir
    }

    pub fn table(&self) -> &Arc<ShardTable> {
        &self.table
    }

    /// Per-shard usage figures
    pub fn stats(&self) -> Vec<ShardStats> {
        self.table
            .shards()
            .iter()
            .enumerate()
            .map(|(index, shard)| ShardStats {
                index,
                entries: shard.entry_count(),
                index_bytes: shard.index_bytes_used(),
                log_bytes: shard.log_bytes_used(),
                filter_trusted: shard.filter().is_trusted(),
            })
            .collect()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}
