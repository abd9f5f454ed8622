//! Persistent Arena
//!
//! Bump allocator over one mapped region. The only persisted allocator state
//! is the bytes-remaining word at offset 0; the cursor is derived from it on
//! recovery, so reopening never scans the region.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info};

use super::region::MappedRegion;
use crate::config::PersistStrategy;
use crate::error::{Result, TierError};

/// Alignment of every allocation
pub const ARENA_ALIGN: usize = 8;

/// Offset of the persisted bytes-remaining word
const REMAINING_OFFSET: u64 = 0;

pub struct PersistentArena {
    region: MappedRegion,
    /// Size the owner asked for; anything past it is headroom
    logical_size: usize,
    /// Next free offset (single writer, read by stats)
    cursor: AtomicUsize,
}

impl std::fmt::Debug for PersistentArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentArena")
            .field("logical_size", &self.logical_size)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl PersistentArena {
    /// Create a fresh zero-filled arena of `logical_size × growth` mapped bytes
    ///
    /// The bytes-remaining word is left for the owner to write together with
    /// its own header.
    pub fn create(
        path: &Path,
        logical_size: usize,
        growth: f64,
        strategy: PersistStrategy,
    ) -> Result<Self> {
        let mapped = super::mapped_len(logical_size, growth);
        let region = MappedRegion::create(path, mapped, strategy)?;

        info!(
            "Created arena {:?} (logical {} bytes, mapped {} bytes)",
            path, logical_size, mapped
        );

        Ok(Self {
            region,
            logical_size,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Reopen an existing arena and restore the cursor from the persisted
    /// bytes-remaining word
    pub fn recover(path: &Path, logical_size: usize, strategy: PersistStrategy) -> Result<Self> {
        let region = MappedRegion::open(path, strategy)?;
        let mapped = region.len();

        if mapped < ARENA_ALIGN || mapped % ARENA_ALIGN != 0 {
            return Err(TierError::corruption(format!(
                "arena {:?} has invalid length {}",
                path, mapped
            )));
        }

        let remaining = region.atomic_u64(REMAINING_OFFSET).load(Ordering::Acquire) as usize;
        if remaining > mapped || (mapped - remaining) % ARENA_ALIGN != 0 {
            return Err(TierError::corruption(format!(
                "arena {:?}: bytes remaining {} invalid for a {} byte region",
                path, remaining, mapped
            )));
        }

        let cursor = mapped - remaining;
        info!(
            "Recovered arena {:?} ({} of {} bytes used)",
            path, cursor, mapped
        );

        Ok(Self {
            region,
            logical_size: logical_size.min(mapped),
            cursor: AtomicUsize::new(cursor),
        })
    }

    /// Reserve `bytes` (rounded up to [`ARENA_ALIGN`]) and return the offset
    ///
    /// Callers serialize allocation; readers never allocate.
    pub fn allocate_aligned(&self, bytes: usize) -> Result<u64> {
        let size = bytes.div_ceil(ARENA_ALIGN) * ARENA_ALIGN;
        let offset = self.cursor.load(Ordering::Relaxed);
        let capacity = self.region.len();

        let end = offset
            .checked_add(size)
            .filter(|end| *end <= capacity)
            .ok_or(TierError::OutOfSpace {
                region: "arena",
                requested: size,
                remaining: capacity - offset,
            })?;

        if offset <= self.logical_size && end > self.logical_size {
            debug!(
                "Arena {:?} entered headroom ({} of {} logical bytes)",
                self.region.path(),
                end,
                self.logical_size
            );
        }

        self.cursor.store(end, Ordering::Release);
        Ok(offset as u64)
    }

    /// Absolute address of offset 0 in the current mapping
    pub fn base_ptr(&self) -> *const u8 {
        self.region.base_ptr()
    }

    /// Map-relative offset of an absolute address inside this arena
    pub fn calculate_offset(&self, ptr: *const u8) -> Option<u64> {
        self.region.offset_of(ptr)
    }

    /// Bytes handed out so far
    pub fn memory_usage(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Mapped bytes not yet handed out
    pub fn bytes_remaining(&self) -> usize {
        self.region.len() - self.memory_usage()
    }

    pub fn logical_size(&self) -> usize {
        self.logical_size
    }

    /// Mapped size including headroom
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    pub fn in_headroom(&self) -> bool {
        self.memory_usage() > self.logical_size
    }

    /// Store the current bytes-remaining into the header word and flush it
    ///
    /// Owners call this once their own metadata for an allocation is durable.
    pub fn persist_remaining(&self) -> Result<()> {
        self.region
            .atomic_u64(REMAINING_OFFSET)
            .store(self.bytes_remaining() as u64, Ordering::Release);
        self.region.persist(REMAINING_OFFSET, 8)
    }

    pub(crate) fn region(&self) -> &MappedRegion {
        &self.region
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// Flush the whole arena (used on close with the OS-managed strategy)
    pub fn sync(&self) -> Result<()> {
        self.region.sync_all()
    }
}
