//! Table Module
//!
//! The shard table: routing, whole-table iteration, drain hand-off and the
//! filter metadata file.
//!
//! ## Routing
//! ```text
//! user key ──► xxh64 ──► top log2(N) bits ──► shard[i]
//! ```
//!
//! ## Drain hand-off
//! ```text
//! shards_over_threshold() ──► caller drains each shard (in parallel)
//!                         ──► replace_shards({i: fresh shard})
//!                         ──► old shards released when last Arc drops
//! ```

mod merge;
mod metadata;
mod partition;
mod shard_table;

pub use merge::MergingIterator;
pub use partition::partition;
pub use shard_table::ShardTable;
