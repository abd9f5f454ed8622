//! Mapped Region
//!
//! One file mapped read/write and shared between a single writer and
//! lock-free readers.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64};

use memmap2::{MmapMut, MmapOptions};

use crate::config::PersistStrategy;
use crate::error::{Result, TierError};

/// A file-backed, shared, writable mapping
///
/// ## Access rules
/// - Words that are read while a writer may store to them (headers, node
///   payloads and links) are only touched through `atomic_u64`/`atomic_u32`.
/// - `write` is reserved for bytes no reader can reach yet (fresh allocations,
///   log space past the published cursor).
pub struct MappedRegion {
    /// Backing file path
    path: PathBuf,
    /// Kept open for the lifetime of the mapping
    _file: File,
    /// Owns the mapping; unmapped on drop
    mmap: MmapMut,
    /// Start of the mapping (stable for the mapping's lifetime)
    base: NonNull<u8>,
    len: usize,
    strategy: PersistStrategy,
}

// SAFETY: the mapping is owned by this struct and never remapped. Shared
// mutation follows the access rules above: concurrent accesses are atomic, and
// plain writes only target bytes that are unreachable by readers until a later
// release store publishes them.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Create (or truncate) `path`, size it to `len` zero bytes and map it
    pub fn create(path: &Path, len: usize, strategy: PersistStrategy) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| mapping_error(path, e))?;

        file.set_len(len as u64).map_err(|e| mapping_error(path, e))?;

        Self::map(path, file, len, strategy)
    }

    /// Map an existing file at its current length
    pub fn open(path: &Path, strategy: PersistStrategy) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| mapping_error(path, e))?;

        let len = file.metadata().map_err(|e| mapping_error(path, e))?.len() as usize;
        if len == 0 {
            return Err(TierError::corruption(format!(
                "region file {:?} is empty",
                path
            )));
        }

        Self::map(path, file, len, strategy)
    }

    fn map(path: &Path, file: File, len: usize, strategy: PersistStrategy) -> Result<Self> {
        // SAFETY: the file is opened read/write by us and stays open for the
        // mapping's lifetime. Files are owned by one shard at a time.
        let mut mmap = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|e| mapping_error(path, e))?;

        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            mapping_error(path, std::io::Error::other("mapping returned a null address"))
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
            mmap,
            base,
            len,
            strategy,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn strategy(&self) -> PersistStrategy {
        self.strategy
    }

    /// Absolute address of the mapping start (differs on every mapping)
    pub fn base_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Convert an absolute address inside the mapping into a region offset
    pub fn offset_of(&self, ptr: *const u8) -> Option<u64> {
        let start = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        if addr >= start && addr < start + self.len {
            Some((addr - start) as u64)
        } else {
            None
        }
    }

    /// True if `[offset, offset + len)` lies inside the mapping
    pub fn contains(&self, offset: u64, len: usize) -> bool {
        (offset as usize)
            .checked_add(len)
            .map(|end| end <= self.len)
            .unwrap_or(false)
    }

    /// Borrow `len` published bytes starting at `offset`
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        if !self.contains(offset, len) {
            return Err(TierError::corruption(format!(
                "range {}+{} outside region {:?} of {} bytes",
                offset, len, self.path, self.len
            )));
        }
        // SAFETY: bounds checked above; published bytes are never rewritten.
        Ok(unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset as usize), len) })
    }

    /// Copy `bytes` into the mapping at `offset`
    ///
    /// # Safety
    /// The caller must be the region's only writer and no reader may be able to
    /// reach `[offset, offset + bytes.len())` until a later release store.
    pub(crate) unsafe fn write(&self, offset: u64, bytes: &[u8]) {
        assert!(self.contains(offset, bytes.len()), "write outside region");
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            self.base.as_ptr().add(offset as usize),
            bytes.len(),
        );
    }

    /// The 8-byte word at `offset` viewed as an atomic
    pub(crate) fn atomic_u64(&self, offset: u64) -> &AtomicU64 {
        assert!(offset % 8 == 0 && self.contains(offset, 8), "unaligned or out-of-range word {}", offset);
        // SAFETY: aligned, in bounds, and the mapping outlives `&self`.
        unsafe { &*(self.base.as_ptr().add(offset as usize) as *const AtomicU64) }
    }

    /// The 4-byte word at `offset` viewed as an atomic
    pub(crate) fn atomic_u32(&self, offset: u64) -> &AtomicU32 {
        assert!(offset % 4 == 0 && self.contains(offset, 4), "unaligned or out-of-range word {}", offset);
        // SAFETY: aligned, in bounds, and the mapping outlives `&self`.
        unsafe { &*(self.base.as_ptr().add(offset as usize) as *const AtomicU32) }
    }

    /// Force `[offset, offset + len)` out of volatile caches
    pub fn persist(&self, offset: u64, len: usize) -> Result<()> {
        if len == 0 || self.strategy == PersistStrategy::OsManaged {
            return Ok(());
        }
        self.mmap.flush_range(offset as usize, len)?;
        Ok(())
    }

    /// Flush the whole mapping regardless of strategy
    pub fn sync_all(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

fn mapping_error(path: &Path, source: std::io::Error) -> TierError {
    TierError::Mapping {
        path: path.to_path_buf(),
        source,
    }
}
