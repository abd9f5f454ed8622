//! Persistent skip list
//!
//! Nodes live in a [`PersistentArena`]; each node's payload is the offset of
//! its record in the shard's [`PersistentLog`], so keys are read from the log
//! during traversal.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info};

use super::node::{
    decode_link, node_size, Header, NodeRef, BRANCHING, FIRST_NODE_OFFSET, HEADER_SIZE,
    HEAD_OFFSET, MAX_HEIGHT,
};
use crate::config::{OverwritePolicy, ShardOptions};
use crate::error::{Result, TierError};
use crate::format::{InternalKeyComparator, SequenceNumber};
use crate::pmem::{PersistentArena, PersistentLog};

/// What `add` did with a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new node was linked
    Inserted,
    /// An existing node's payload was overwritten in place
    Updated,
}

/// Points inside `add` where tests can simulate a crash
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CrashPoint {
    /// Node allocated, initialised and flushed; nothing links to it
    AfterAlloc,
    /// Header count and sequence reserved; nothing links to the node yet
    AfterReserve,
    /// Levels `0..=n` published; header not yet updated
    AfterLink(usize),
    /// Header updated
    AfterHeader,
    /// Existing node's payload overwritten
    AfterPayload,
}

pub struct SkipIndex {
    arena: PersistentArena,
    log: Arc<PersistentLog>,
    comparator: InternalKeyComparator,
    policy: OverwritePolicy,
    /// Levels currently in use (read racily by readers)
    max_height: AtomicUsize,
    rng: Mutex<StdRng>,
    #[cfg(test)]
    crash_at: Mutex<Option<CrashPoint>>,
}

impl SkipIndex {
    /// Create an empty index in a fresh arena at `path`
    pub fn create(
        path: &Path,
        options: &ShardOptions,
        log: Arc<PersistentLog>,
        comparator: InternalKeyComparator,
    ) -> Result<Self> {
        let arena = PersistentArena::create(
            path,
            options.index_region_size,
            options.index_growth_factor,
            options.persist_strategy,
        )?;

        // Header and head node are one allocation at offset 0.
        let offset = arena.allocate_aligned(HEADER_SIZE as usize + node_size(MAX_HEIGHT))?;
        debug_assert_eq!(offset, 0);

        let region = arena.region();
        let head = NodeRef::new(region, HEAD_OFFSET);
        head.init(0, MAX_HEIGHT);
        for level in 0..MAX_HEIGHT {
            head.set_next_relaxed(level, None);
        }

        let header = Header::new(region);
        header.last_sequence().store(0, AtomicOrdering::Relaxed);
        header.max_height().store(1, AtomicOrdering::Relaxed);
        header.node_count().store(0, AtomicOrdering::Relaxed);
        arena.persist_remaining()?;
        region.persist(0, FIRST_NODE_OFFSET as usize)?;

        Ok(Self::from_parts(arena, log, comparator, options.overwrite_policy, 1))
    }

    /// Reopen an index written by a previous process
    pub fn recover(
        path: &Path,
        options: &ShardOptions,
        log: Arc<PersistentLog>,
        comparator: InternalKeyComparator,
    ) -> Result<Self> {
        let arena =
            PersistentArena::recover(path, options.index_region_size, options.persist_strategy)?;
        let used = arena.memory_usage() as u64;

        if used < FIRST_NODE_OFFSET {
            error!("Index {:?} recovery failed: header incomplete", path);
            return Err(TierError::corruption(format!(
                "index {:?} uses {} bytes, less than its header and head node",
                path, used
            )));
        }

        let region = arena.region();
        let header = Header::new(region);
        let persisted_height = header.max_height().load(AtomicOrdering::Acquire) as i32;
        if persisted_height < 1 || persisted_height as usize > MAX_HEIGHT {
            error!("Index {:?} recovery failed: bad max height", path);
            return Err(TierError::corruption(format!(
                "index {:?} max height {} outside 1..={}",
                path, persisted_height, MAX_HEIGHT
            )));
        }

        let node_count = header.node_count().load(AtomicOrdering::Acquire);
        let min_node = node_size(1) as u64;
        if node_count > (used - FIRST_NODE_OFFSET) / min_node {
            error!("Index {:?} recovery failed: bad node count", path);
            return Err(TierError::corruption(format!(
                "index {:?} claims {} nodes in {} bytes",
                path, node_count, used
            )));
        }

        let head = NodeRef::new(region, HEAD_OFFSET);
        if head.height() != MAX_HEIGHT as u64 {
            return Err(TierError::corruption(format!(
                "index {:?} head node has height {}",
                path,
                head.height()
            )));
        }

        // Links may have been published above the persisted height before a crash.
        let linked_height = (0..MAX_HEIGHT)
            .rev()
            .find(|&level| head.raw_next(level) != 0)
            .map(|level| level + 1)
            .unwrap_or(1);
        let max_height = linked_height.max(persisted_height as usize);

        info!(
            "Recovered index {:?}: {} nodes, last sequence {}, height {}",
            path,
            node_count,
            header.last_sequence().load(AtomicOrdering::Acquire),
            max_height
        );

        Ok(Self::from_parts(
            arena,
            log,
            comparator,
            options.overwrite_policy,
            max_height,
        ))
    }

    fn from_parts(
        arena: PersistentArena,
        log: Arc<PersistentLog>,
        comparator: InternalKeyComparator,
        policy: OverwritePolicy,
        max_height: usize,
    ) -> Self {
        Self {
            arena,
            log,
            comparator,
            policy,
            max_height: AtomicUsize::new(max_height),
            rng: Mutex::new(StdRng::from_entropy()),
            #[cfg(test)]
            crash_at: Mutex::new(None),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert `internal_key`, whose record lives at `log_offset`
    ///
    /// A key that compares equal under the overwrite policy has its payload
    /// replaced instead. Callers serialize `add`.
    ///
    /// The header's sequence and node count are persisted before the node
    /// becomes reachable. A crash before the level-0 link leaves the count
    /// one high; the sequence is never below a reachable record's.
    pub fn add(
        &self,
        internal_key: &[u8],
        log_offset: u64,
        sequence: SequenceNumber,
    ) -> Result<AddOutcome> {
        let region = self.arena.region();
        let header = Header::new(region);

        let mut prev = [HEAD_OFFSET; MAX_HEIGHT];
        let found = self.find_greater_or_equal(internal_key, Some(&mut prev))?;

        if let Some(existing) = found {
            if self.compare(self.key(existing)?, internal_key) == Ordering::Equal {
                self.bump_last_sequence(sequence)?;
                let node = NodeRef::new(region, existing);
                node.set_payload(log_offset);
                region.persist(existing, 8)?;
                self.crash_point(CrashPoint::AfterPayload)?;
                return Ok(AddOutcome::Updated);
            }
        }

        // 1. Allocate and initialise the node while nothing can see it.
        let height = self.random_height();
        let offset = self.arena.allocate_aligned(node_size(height))?;
        let node = NodeRef::new(region, offset);
        node.init(log_offset, height);
        for (level, &before) in prev.iter().enumerate().take(height) {
            node.set_next_relaxed(level, self.next_of(before, level)?);
        }
        region.persist(offset, node_size(height))?;
        self.arena.persist_remaining()?;
        self.crash_point(CrashPoint::AfterAlloc)?;

        // 2. Reserve the header scalars.
        header.node_count().fetch_add(1, AtomicOrdering::AcqRel);
        let last = header.last_sequence().load(AtomicOrdering::Relaxed);
        header
            .last_sequence()
            .store(last.max(sequence), AtomicOrdering::Release);
        region.persist(0, HEADER_SIZE as usize)?;
        self.crash_point(CrashPoint::AfterReserve)?;

        if height > self.max_height() {
            self.max_height.store(height, AtomicOrdering::Relaxed);
        }

        // 3. Publish bottom-up; every level is durable before the next.
        for (level, &before) in prev.iter().enumerate().take(height) {
            let pred = NodeRef::new(region, before);
            pred.set_next(level, Some(offset));
            region.persist(pred.link_offset(level), 8)?;
            self.crash_point(CrashPoint::AfterLink(level))?;
        }

        // 4. Height; recovery also derives it from the head's links.
        if height as u32 > header.max_height().load(AtomicOrdering::Relaxed) {
            header.max_height().store(height as u32, AtomicOrdering::Release);
            region.persist(0, HEADER_SIZE as usize)?;
        }
        self.crash_point(CrashPoint::AfterHeader)?;

        Ok(AddOutcome::Inserted)
    }

    fn bump_last_sequence(&self, sequence: SequenceNumber) -> Result<()> {
        let header = Header::new(self.arena.region());
        if sequence > header.last_sequence().load(AtomicOrdering::Relaxed) {
            header
                .last_sequence()
                .store(sequence, AtomicOrdering::Release);
            self.arena.region().persist(0, HEADER_SIZE as usize)?;
        }
        Ok(())
    }

    fn random_height(&self) -> usize {
        let mut rng = self.rng.lock();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_range(0..BRANCHING) == 0 {
            height += 1;
        }
        height
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// True if a node comparing equal to `internal_key` exists
    pub fn contains(&self, internal_key: &[u8]) -> Result<bool> {
        match self.seek(internal_key)? {
            Some(node) => Ok(self.compare(self.key(node)?, internal_key) == Ordering::Equal),
            None => Ok(false),
        }
    }

    /// First node at or after `internal_key`
    pub fn seek(&self, internal_key: &[u8]) -> Result<Option<u64>> {
        self.find_greater_or_equal(internal_key, None)
    }

    /// Last node strictly before `internal_key`
    pub fn find_less_than(&self, internal_key: &[u8]) -> Result<Option<u64>> {
        let mut node = HEAD_OFFSET;
        let mut level = self.max_height() - 1;
        loop {
            match self.next_of(node, level)? {
                Some(next) if self.compare(self.key(next)?, internal_key) == Ordering::Less => {
                    node = next;
                }
                _ => {
                    if level == 0 {
                        return Ok((node != HEAD_OFFSET).then_some(node));
                    }
                    level -= 1;
                }
            }
        }
    }

    pub fn first(&self) -> Result<Option<u64>> {
        self.next_of(HEAD_OFFSET, 0)
    }

    pub fn last(&self) -> Result<Option<u64>> {
        let mut node = HEAD_OFFSET;
        let mut level = self.max_height() - 1;
        loop {
            match self.next_of(node, level)? {
                Some(next) => node = next,
                None => {
                    if level == 0 {
                        return Ok((node != HEAD_OFFSET).then_some(node));
                    }
                    level -= 1;
                }
            }
        }
    }

    /// Level-0 successor of `node`
    pub fn next(&self, node: u64) -> Result<Option<u64>> {
        self.next_of(node, 0)
    }

    /// Log offset stored in `node`
    pub fn payload(&self, node: u64) -> u64 {
        NodeRef::new(self.arena.region(), node).payload()
    }

    /// Internal key of `node`, read from the log
    pub fn key(&self, node: u64) -> Result<&[u8]> {
        self.log.read_internal_key(self.payload(node))
    }

    /// Iterate log offsets in key order
    pub fn iter(&self) -> IndexIter<'_> {
        IndexIter {
            index: self,
            next: self.first(),
        }
    }

    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [u64; MAX_HEIGHT]>,
    ) -> Result<Option<u64>> {
        let mut node = HEAD_OFFSET;
        let mut level = self.max_height() - 1;
        loop {
            let next = self.next_of(node, level)?;
            if let Some(candidate) = next {
                if self.compare(self.key(candidate)?, key) == Ordering::Less {
                    node = candidate;
                    continue;
                }
            }
            if let Some(prev) = prev.as_deref_mut() {
                prev[level] = node;
            }
            if level == 0 {
                return Ok(next);
            }
            level -= 1;
        }
    }

    /// Resolve and validate `node`'s link at `level`
    fn next_of(&self, node: u64, level: usize) -> Result<Option<u64>> {
        let region = self.arena.region();
        let raw = NodeRef::new(region, node).raw_next(level);
        let Some(target) = decode_link(node, raw) else {
            return Ok(None);
        };

        // A node of height 1 is the smallest thing a link may point at.
        let used = self.arena.memory_usage() as i64;
        let smallest = node_size(1) as i64;
        if target < FIRST_NODE_OFFSET as i64 || target > used - smallest || target % 8 != 0 {
            return Err(TierError::corruption(format!(
                "link at level {} of node {} decodes to {} outside [{}, {})",
                level, node, target, FIRST_NODE_OFFSET, used
            )));
        }
        let target = target as u64;
        let height = NodeRef::new(region, target).height();
        if height as usize <= level || height as usize > MAX_HEIGHT {
            return Err(TierError::corruption(format!(
                "node {} of height {} linked at level {}",
                target, height, level
            )));
        }
        if target + node_size(height as usize) as u64 > used as u64 {
            return Err(TierError::corruption(format!(
                "node {} of height {} runs past {} used bytes",
                target, height, used
            )));
        }
        Ok(Some(target))
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.policy {
            OverwritePolicy::MultiVersion => self.comparator.compare(a, b),
            OverwritePolicy::LatestOnly => self.comparator.compare_user(a, b),
        }
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub fn node_count(&self) -> u64 {
        Header::new(self.arena.region())
            .node_count()
            .load(AtomicOrdering::Acquire)
    }

    pub fn last_sequence(&self) -> SequenceNumber {
        Header::new(self.arena.region())
            .last_sequence()
            .load(AtomicOrdering::Acquire)
    }

    pub fn max_height(&self) -> usize {
        self.max_height.load(AtomicOrdering::Relaxed)
    }

    pub fn head_offset(&self) -> u64 {
        HEAD_OFFSET
    }

    pub fn memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    pub fn arena(&self) -> &PersistentArena {
        &self.arena
    }

    pub fn log(&self) -> &Arc<PersistentLog> {
        &self.log
    }

    pub fn policy(&self) -> OverwritePolicy {
        self.policy
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.comparator
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    fn crash_point(&self, _point: CrashPoint) -> Result<()> {
        #[cfg(test)]
        if *self.crash_at.lock() == Some(_point) {
            return Err(TierError::InjectedCrash);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn crash_at(&self, point: CrashPoint) {
        *self.crash_at.lock() = Some(point);
    }
}

/// Forward walk over an index yielding log offsets
pub struct IndexIter<'a> {
    index: &'a SkipIndex,
    next: Result<Option<u64>>,
}

impl Iterator for IndexIter<'_> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = std::mem::replace(&mut self.next, Ok(None));
        match current {
            Ok(Some(node)) => {
                self.next = self.index.next(node);
                Some(Ok(self.index.payload(node)))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
