//! Ordered cursor over internal-key/value entries
//!
//! Implemented by [`crate::shard::ShardIterator`] (one shard) and
//! [`crate::table::MergingIterator`] (all shards of a table).
//!
//! Movement methods return `Result` because every step reads persistent
//! links and log records that are validated on the way. `key`/`value` are
//! only meaningful while `valid()` is true.

use crate::error::Result;

pub trait EntryIterator {
    /// True when positioned at an entry
    fn valid(&self) -> bool;

    fn seek_to_first(&mut self) -> Result<()>;

    fn seek_to_last(&mut self) -> Result<()>;

    /// Position at the first entry whose internal key is at or after `target`
    fn seek(&mut self, target: &[u8]) -> Result<()>;

    fn next(&mut self) -> Result<()>;

    fn prev(&mut self) -> Result<()>;

    /// Internal key (user key + tag) of the current entry
    fn key(&self) -> &[u8];

    /// Value of the current entry (empty for deletions)
    fn value(&self) -> &[u8];
}
