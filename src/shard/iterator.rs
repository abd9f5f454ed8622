//! Shard iterator
//!
//! Walks one shard's index in key order. Holding an `Arc<Shard>` keeps the
//! shard's mappings alive even after the table has swapped it out.

use std::sync::Arc;

use super::core::Shard;
use crate::error::Result;
use crate::format::RecordRef;
use crate::iterator::EntryIterator;

pub struct ShardIterator {
    shard: Arc<Shard>,
    /// Current node offset; `None` when not positioned
    node: Option<u64>,
}

impl ShardIterator {
    pub(crate) fn new(shard: Arc<Shard>) -> Self {
        Self { shard, node: None }
    }

    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    /// Decoded record at the current position
    pub fn record(&self) -> Option<RecordRef<'_>> {
        let node = self.node?;
        let offset = self.shard.index().payload(node);
        self.shard.log().read_record(offset).ok()
    }

    /// Move to `node`, validating its record first
    fn settle(&mut self, node: Option<u64>) -> Result<()> {
        if let Some(node) = node {
            let offset = self.shard.index().payload(node);
            self.shard.log().read_record(offset)?;
        }
        self.node = node;
        Ok(())
    }
}

impl EntryIterator for ShardIterator {
    fn valid(&self) -> bool {
        self.node.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        let node = self.shard.index().first()?;
        self.settle(node)
    }

    fn seek_to_last(&mut self) -> Result<()> {
        let node = self.shard.index().last()?;
        self.settle(node)
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        let node = self.shard.index().seek(target)?;
        self.settle(node)
    }

    fn next(&mut self) -> Result<()> {
        let Some(current) = self.node else {
            return Ok(());
        };
        let node = self.shard.index().next(current)?;
        self.settle(node)
    }

    fn prev(&mut self) -> Result<()> {
        let Some(current) = self.node else {
            return Ok(());
        };
        let index = self.shard.index();
        let node = index.find_less_than(index.key(current)?)?;
        self.settle(node)
    }

    fn key(&self) -> &[u8] {
        self.record().map(|r| r.internal_key).unwrap_or(&[])
    }

    fn value(&self) -> &[u8] {
        self.record().map(|r| r.value).unwrap_or(&[])
    }
}
