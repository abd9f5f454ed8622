//! Configuration for nvtier
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TierError};

/// Largest supported shard count
pub const MAX_SHARDS: usize = 256;

/// Main configuration for an nvtier instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── CATALOG           (shard file ids + last sequence)
    ///     ├── filters.meta      (membership filters, written on close)
    ///     └── shards/           (index and log regions)
    pub data_dir: PathBuf,

    /// Number of shards (power of two, fixed for the table's lifetime)
    pub num_shards: usize,

    // -------------------------------------------------------------------------
    // Region Configuration
    // -------------------------------------------------------------------------
    /// Logical size of each shard's index arena (bytes)
    pub index_region_size: usize,

    /// Logical size of each shard's log (bytes)
    pub log_region_size: usize,

    /// Mapped size of an index arena = logical size × this factor
    pub index_growth_factor: f64,

    /// Mapped size of a log = logical size × this factor
    pub log_growth_factor: f64,

    /// How stores into mapped regions are made durable
    pub persist_strategy: PersistStrategy,

    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    /// What happens when a key already present in a shard is written again
    pub overwrite_policy: OverwritePolicy,

    // -------------------------------------------------------------------------
    // Filter Configuration
    // -------------------------------------------------------------------------
    /// Bits per shard membership filter (multiple of 64)
    pub filter_bits: usize,

    /// Probes per key
    pub filter_hash_count: u32,

    // -------------------------------------------------------------------------
    // Drain Configuration
    // -------------------------------------------------------------------------
    /// A shard whose index usage reaches this many bytes is drained
    pub index_drain_threshold: usize,

    /// A shard whose log usage reaches this many bytes is drained
    pub log_drain_threshold: usize,
}

/// Durability strategy for mapped regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStrategy {
    /// msync the touched range after every durability-critical store (safest, slowest)
    EveryWrite,

    /// Leave write-back to the OS page cache (fast; survives process crashes, not power loss)
    OsManaged,
}

/// Behaviour when a shard receives a key it already holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverwritePolicy {
    /// Nodes are ordered by full internal key; every sequence number keeps its own
    /// node, so older versions stay visible to older snapshots.
    MultiVersion,

    /// Nodes are ordered by user key only; a second write to the same user key
    /// overwrites the node's log offset in place (last writer wins).
    LatestOnly,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./nvtier_data"),
            num_shards: 8,
            index_region_size: 16 * 1024 * 1024, // 16 MB
            log_region_size: 64 * 1024 * 1024,   // 64 MB
            index_growth_factor: 1.5,
            log_growth_factor: 1.5,
            persist_strategy: PersistStrategy::EveryWrite,
            overwrite_policy: OverwritePolicy::MultiVersion,
            filter_bits: 1 << 20,
            filter_hash_count: 4,
            index_drain_threshold: 16 * 1024 * 1024,
            log_drain_threshold: 64 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings the shard table cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.num_shards == 0 || !self.num_shards.is_power_of_two() {
            return Err(TierError::Config(format!(
                "num_shards must be a power of two, got {}",
                self.num_shards
            )));
        }
        if self.num_shards > MAX_SHARDS {
            return Err(TierError::Config(format!(
                "num_shards must be at most {}, got {}",
                MAX_SHARDS, self.num_shards
            )));
        }
        if self.index_region_size == 0 || self.log_region_size == 0 {
            return Err(TierError::Config(
                "region sizes must be non-zero".to_string(),
            ));
        }
        if !(self.index_growth_factor >= 1.0) || !(self.log_growth_factor >= 1.0) {
            return Err(TierError::Config(format!(
                "growth factors must be >= 1.0, got index={} log={}",
                self.index_growth_factor, self.log_growth_factor
            )));
        }
        if self.filter_bits == 0 || self.filter_bits % 64 != 0 {
            return Err(TierError::Config(format!(
                "filter_bits must be a non-zero multiple of 64, got {}",
                self.filter_bits
            )));
        }
        if self.filter_hash_count == 0 {
            return Err(TierError::Config(
                "filter_hash_count must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-shard construction parameters derived from this config
    pub fn shard_options(&self) -> ShardOptions {
        ShardOptions {
            index_region_size: self.index_region_size,
            log_region_size: self.log_region_size,
            index_growth_factor: self.index_growth_factor,
            log_growth_factor: self.log_growth_factor,
            persist_strategy: self.persist_strategy,
            overwrite_policy: self.overwrite_policy,
            filter_bits: self.filter_bits,
            filter_hash_count: self.filter_hash_count,
        }
    }
}

/// The part of [`Config`] a single shard is built from
#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub index_region_size: usize,
    pub log_region_size: usize,
    pub index_growth_factor: f64,
    pub log_growth_factor: f64,
    pub persist_strategy: PersistStrategy,
    pub overwrite_policy: OverwritePolicy,
    pub filter_bits: usize,
    pub filter_hash_count: u32,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Config::default().shard_options()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the number of shards
    pub fn num_shards(mut self, count: usize) -> Self {
        self.config.num_shards = count;
        self
    }

    /// Set the logical index arena size (in bytes)
    pub fn index_region_size(mut self, size: usize) -> Self {
        self.config.index_region_size = size;
        self
    }

    /// Set the logical log size (in bytes)
    pub fn log_region_size(mut self, size: usize) -> Self {
        self.config.log_region_size = size;
        self
    }

    /// Set the index arena headroom multiplier
    pub fn index_growth_factor(mut self, factor: f64) -> Self {
        self.config.index_growth_factor = factor;
        self
    }

    /// Set the log headroom multiplier
    pub fn log_growth_factor(mut self, factor: f64) -> Self {
        self.config.log_growth_factor = factor;
        self
    }

    /// Set the persist strategy
    pub fn persist_strategy(mut self, strategy: PersistStrategy) -> Self {
        self.config.persist_strategy = strategy;
        self
    }

    /// Set the overwrite policy
    pub fn overwrite_policy(mut self, policy: OverwritePolicy) -> Self {
        self.config.overwrite_policy = policy;
        self
    }

    /// Set the membership filter size (in bits)
    pub fn filter_bits(mut self, bits: usize) -> Self {
        self.config.filter_bits = bits;
        self
    }

    /// Set the number of filter probes per key
    pub fn filter_hash_count(mut self, count: u32) -> Self {
        self.config.filter_hash_count = count;
        self
    }

    /// Set the index usage (bytes) at which a shard is drained
    pub fn index_drain_threshold(mut self, bytes: usize) -> Self {
        self.config.index_drain_threshold = bytes;
        self
    }

    /// Set the log usage (bytes) at which a shard is drained
    pub fn log_drain_threshold(mut self, bytes: usize) -> Self {
        self.config.log_drain_threshold = bytes;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
