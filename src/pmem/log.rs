//! Persistent Log
//!
//! Append-only record storage in one mapped region.
//!
//! ```text
//! ┌──────────────────┬──────────┬──────────┬─────┬───────────────┐
//! │ remaining: u64   │ record 0 │ record 1 │ ... │ free/headroom │
//! └──────────────────┴──────────┴──────────┴─────┴───────────────┘
//! 0                  8
//! ```
//!
//! Offset 0 is never a record, so a zero payload in an index node can never
//! alias a real entry.
//!
//! ## Append ordering
//! 1. Copy the record past the cursor and flush it
//! 2. Store the new bytes-remaining and flush the header word
//! 3. Publish the cursor to readers
//!
//! A crash between 1 and 2 leaves an unreferenced tail that the next append
//! overwrites.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info};

use super::region::MappedRegion;
use crate::config::PersistStrategy;
use crate::error::{Result, TierError};
use crate::format::{extract_user_key, RecordRef};

/// Bytes reserved for the header at the start of the log
pub const LOG_HEADER_SIZE: usize = 8;

const REMAINING_OFFSET: u64 = 0;

pub struct PersistentLog {
    region: MappedRegion,
    logical_size: usize,
    /// End of the last published record
    cursor: AtomicUsize,
}

impl std::fmt::Debug for PersistentLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentLog")
            .field("logical_size", &self.logical_size)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl PersistentLog {
    /// Create an empty log mapped at `logical_size × growth` bytes
    pub fn create(
        path: &Path,
        logical_size: usize,
        growth: f64,
        strategy: PersistStrategy,
    ) -> Result<Self> {
        let mapped = super::mapped_len(logical_size.max(LOG_HEADER_SIZE), growth);
        let region = MappedRegion::create(path, mapped, strategy)?;

        region
            .atomic_u64(REMAINING_OFFSET)
            .store((mapped - LOG_HEADER_SIZE) as u64, Ordering::Release);
        region.persist(REMAINING_OFFSET, LOG_HEADER_SIZE)?;

        info!(
            "Created log {:?} (logical {} bytes, mapped {} bytes)",
            path, logical_size, mapped
        );

        Ok(Self {
            region,
            logical_size,
            cursor: AtomicUsize::new(LOG_HEADER_SIZE),
        })
    }

    /// Reopen a log and restore its append cursor from the header
    pub fn recover(path: &Path, logical_size: usize, strategy: PersistStrategy) -> Result<Self> {
        let region = MappedRegion::open(path, strategy)?;
        let mapped = region.len();

        if mapped < LOG_HEADER_SIZE {
            return Err(TierError::corruption(format!(
                "log {:?} is shorter than its header ({} bytes)",
                path, mapped
            )));
        }

        let remaining = region.atomic_u64(REMAINING_OFFSET).load(Ordering::Acquire) as usize;
        if remaining > mapped - LOG_HEADER_SIZE {
            return Err(TierError::corruption(format!(
                "log {:?}: bytes remaining {} invalid for a {} byte region",
                path, remaining, mapped
            )));
        }

        let cursor = mapped - remaining;
        info!(
            "Recovered log {:?} ({} record bytes)",
            path,
            cursor - LOG_HEADER_SIZE
        );

        Ok(Self {
            region,
            logical_size: logical_size.min(mapped),
            cursor: AtomicUsize::new(cursor),
        })
    }

    /// Append one encoded record and return its offset
    ///
    /// Callers serialize appends.
    pub fn append(&self, record: &[u8]) -> Result<u64> {
        if record.is_empty() {
            return Err(TierError::InvalidRecord("empty log record".to_string()));
        }

        let offset = self.cursor.load(Ordering::Relaxed);
        let capacity = self.region.len();
        let end = offset
            .checked_add(record.len())
            .filter(|end| *end <= capacity)
            .ok_or(TierError::OutOfSpace {
                region: "log",
                requested: record.len(),
                remaining: capacity - offset,
            })?;

        // SAFETY: single writer, and the range lies past the published cursor.
        unsafe { self.region.write(offset as u64, record) };
        self.region.persist(offset as u64, record.len())?;

        self.region
            .atomic_u64(REMAINING_OFFSET)
            .store((capacity - end) as u64, Ordering::Release);
        self.region.persist(REMAINING_OFFSET, LOG_HEADER_SIZE)?;

        if offset <= self.logical_size && end > self.logical_size {
            debug!(
                "Log {:?} entered headroom ({} of {} logical bytes)",
                self.region.path(),
                end,
                self.logical_size
            );
        }

        self.cursor.store(end, Ordering::Release);
        Ok(offset as u64)
    }

    /// Decode the record starting at `offset`
    pub fn read_record(&self, offset: u64) -> Result<RecordRef<'_>> {
        let end = self.cursor.load(Ordering::Acquire);
        let start = offset as usize;
        if start < LOG_HEADER_SIZE || start >= end {
            return Err(TierError::corruption(format!(
                "log offset {} outside written range [{}, {}) of {:?}",
                offset,
                LOG_HEADER_SIZE,
                end,
                self.region.path()
            )));
        }

        let buf = self.region.slice(offset, end - start)?;
        RecordRef::decode(buf).map_err(|e| {
            TierError::corruption(format!(
                "log {:?} record at {}: {}",
                self.region.path(),
                offset,
                e
            ))
        })
    }

    /// Internal key (user key + tag) of the record at `offset`
    pub fn read_internal_key(&self, offset: u64) -> Result<&[u8]> {
        Ok(self.read_record(offset)?.internal_key)
    }

    pub fn read_user_key(&self, offset: u64) -> Result<&[u8]> {
        Ok(extract_user_key(self.read_internal_key(offset)?))
    }

    /// Value of the record at `offset` (empty for deletions)
    pub fn read_value(&self, offset: u64) -> Result<&[u8]> {
        Ok(self.read_record(offset)?.value)
    }

    /// Record bytes appended so far
    pub fn bytes_used(&self) -> usize {
        self.cursor.load(Ordering::Acquire) - LOG_HEADER_SIZE
    }

    pub fn logical_size(&self) -> usize {
        self.logical_size
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    /// Flush the whole log (used on close with the OS-managed strategy)
    pub fn sync(&self) -> Result<()> {
        self.region.sync_all()
    }
}
