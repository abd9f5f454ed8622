//! Node and header layout inside the index arena

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::pmem::MappedRegion;

/// Tallest tower a node can have
pub const MAX_HEIGHT: usize = 12;

/// One in `BRANCHING` nodes at level i is also on level i + 1
pub const BRANCHING: u32 = 4;

// -----------------------------------------------------------------------------
// Header
// -----------------------------------------------------------------------------

// Offset 0 holds the arena's bytes-remaining word.
pub(crate) const HDR_LAST_SEQUENCE: u64 = 8;
/// Signed 32-bit value followed by 4 bytes of padding
pub(crate) const HDR_MAX_HEIGHT: u64 = 16;
pub(crate) const HDR_NODE_COUNT: u64 = 24;

pub const HEADER_SIZE: u64 = 32;

/// The head node always sits right after the header
pub const HEAD_OFFSET: u64 = HEADER_SIZE;

// -----------------------------------------------------------------------------
// Node
// -----------------------------------------------------------------------------
//
// ┌──────────────┬─────────────┬──────────────┬─────┬──────────────────┐
// │ payload: u64 │ height: u64 │ next[0]: i64 │ ... │ next[h - 1]: i64 │
// └──────────────┴─────────────┴──────────────┴─────┴──────────────────┘
//
// next[i] = this node's offset - neighbour's offset; 0 means no neighbour.

const PAYLOAD: u64 = 0;
const HEIGHT: u64 = 8;
const LINKS: u64 = 16;

pub(crate) const fn node_size(height: usize) -> usize {
    LINKS as usize + 8 * height
}

/// Offset of the first node after the head (nothing valid lives below it)
pub(crate) const FIRST_NODE_OFFSET: u64 = HEAD_OFFSET + node_size(MAX_HEIGHT) as u64;

/// Encode a link from `node` to `target`
pub(crate) fn encode_link(node: u64, target: Option<u64>) -> u64 {
    match target {
        Some(target) => (node as i64).wrapping_sub(target as i64) as u64,
        None => 0,
    }
}

/// Decode a stored link back to the neighbour's offset (unchecked)
pub(crate) fn decode_link(node: u64, raw: u64) -> Option<i64> {
    if raw == 0 {
        None
    } else {
        Some((node as i64).wrapping_sub(raw as i64))
    }
}

/// Typed view of one node in a mapped region
#[derive(Clone, Copy)]
pub(crate) struct NodeRef<'a> {
    region: &'a MappedRegion,
    offset: u64,
}

impl<'a> NodeRef<'a> {
    pub(crate) fn new(region: &'a MappedRegion, offset: u64) -> Self {
        Self { region, offset }
    }

    fn payload_word(&self) -> &'a AtomicU64 {
        self.region.atomic_u64(self.offset + PAYLOAD)
    }

    fn link_word(&self, level: usize) -> &'a AtomicU64 {
        self.region.atomic_u64(self.link_offset(level))
    }

    pub(crate) fn link_offset(&self, level: usize) -> u64 {
        self.offset + LINKS + 8 * level as u64
    }

    pub(crate) fn payload(&self) -> u64 {
        self.payload_word().load(Ordering::Acquire)
    }

    pub(crate) fn set_payload(&self, payload: u64) {
        self.payload_word().store(payload, Ordering::Release);
    }

    pub(crate) fn height(&self) -> u64 {
        self.region
            .atomic_u64(self.offset + HEIGHT)
            .load(Ordering::Relaxed)
    }

    /// Raw link at `level`, acquire-loaded for readers
    pub(crate) fn raw_next(&self, level: usize) -> u64 {
        self.link_word(level).load(Ordering::Acquire)
    }

    /// Initialise an unpublished node
    pub(crate) fn init(&self, payload: u64, height: usize) {
        self.payload_word().store(payload, Ordering::Relaxed);
        self.region
            .atomic_u64(self.offset + HEIGHT)
            .store(height as u64, Ordering::Relaxed);
    }

    /// Set an unpublished node's link (no ordering needed yet)
    pub(crate) fn set_next_relaxed(&self, level: usize, target: Option<u64>) {
        self.link_word(level)
            .store(encode_link(self.offset, target), Ordering::Relaxed);
    }

    /// Publish a link to concurrent readers
    pub(crate) fn set_next(&self, level: usize, target: Option<u64>) {
        self.link_word(level)
            .store(encode_link(self.offset, target), Ordering::Release);
    }
}

/// Typed view of the index header
#[derive(Clone, Copy)]
pub(crate) struct Header<'a> {
    region: &'a MappedRegion,
}

impl<'a> Header<'a> {
    pub(crate) fn new(region: &'a MappedRegion) -> Self {
        Self { region }
    }

    pub(crate) fn last_sequence(&self) -> &'a AtomicU64 {
        self.region.atomic_u64(HDR_LAST_SEQUENCE)
    }

    pub(crate) fn max_height(&self) -> &'a AtomicU32 {
        self.region.atomic_u32(HDR_MAX_HEIGHT)
    }

    pub(crate) fn node_count(&self) -> &'a AtomicU64 {
        self.region.atomic_u64(HDR_NODE_COUNT)
    }
}
