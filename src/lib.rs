//! # nvtier
//!
//! A persistent-memory write tier for log-structured storage engines:
//! - Memory-mapped regions standing in for byte-addressable NVM
//! - Crash-consistent skip index with address-independent links
//! - Append-only record log; no separate write-ahead log
//! - Hash-partitioned shards drained to disk in parallel
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │        (sequence numbers, catalog, drain, close)             │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                      Shard Table                             │
//! │         (xxh64 partition, merging iterator, filters)         │
//! └──────┬──────────────┬──────────────┬──────────────┬─────────┘
//!        ▼              ▼              ▼              ▼
//!   ┌─────────┐    ┌─────────┐    ┌─────────┐    ┌─────────┐
//!   │ Shard 0 │    │ Shard 1 │    │   ...   │    │ Shard N │
//!   └────┬────┘    └─────────┘    └─────────┘    └─────────┘
//!        │
//!        ├──► Skip Index  (persistent arena, self-relative links)
//!        ├──► Log         (persistent, append-only records)
//!        └──► Filter      (DRAM bloom filter)
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod format;
pub mod pmem;
pub mod index;
pub mod iterator;
pub mod shard;
pub mod table;
pub mod catalog;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, TierError};
pub use config::Config;
pub use engine::Engine;
pub use iterator::EntryIterator;
pub use shard::{Lookup, Shard};
pub use table::ShardTable;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of nvtier
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
