//! Filter metadata side file
//!
//! Filters live in DRAM; this file carries them across a clean restart.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ magic "NVTF" │ version u16 │ shard count u32 │ filter bytes u32 │
//! ├────────────────────────────────────────────────────────────┤
//! │ per shard: log file id u64 │ log bytes used u64 │ bit array │
//! ├────────────────────────────────────────────────────────────┤
//! │ crc32 u32 over everything above                              │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The (log file id, log bytes used) pair fingerprints the shard state a
//! filter was saved for. A slot is only restored into a shard with the same
//! fingerprint, so writes that happened after the save can't be missed.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, TierError};
use crate::shard::Shard;

const MAGIC: &[u8; 4] = b"NVTF";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 4 + 2 + 4 + 4;
const SLOT_HEADER_SIZE: usize = 8 + 8;
const CRC_SIZE: usize = 4;

/// Write every shard's filter to `path` (temp file + rename)
///
/// Untrusted filters are rebuilt first, so a saved image is always complete.
pub fn save(path: &Path, shards: &[Arc<Shard>]) -> Result<()> {
    let filter_bytes = shards
        .first()
        .map(|s| s.filter().byte_len())
        .unwrap_or(0);

    let mut buf = Vec::with_capacity(
        HEADER_SIZE + shards.len() * (SLOT_HEADER_SIZE + filter_bytes) + CRC_SIZE,
    );
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&(shards.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(filter_bytes as u32).to_le_bytes());

    for shard in shards {
        if shard.filter().byte_len() != filter_bytes {
            return Err(TierError::Config(format!(
                "shard {:?} filter has {} bytes, expected {}",
                shard.index_path(),
                shard.filter().byte_len(),
                filter_bytes
            )));
        }
        if !shard.filter().is_trusted() {
            shard.rebuild_filter()?;
        }
        buf.extend_from_slice(&shard.log_file_id().to_le_bytes());
        buf.extend_from_slice(&(shard.log_bytes_used() as u64).to_le_bytes());
        buf.extend_from_slice(&shard.filter().to_bytes());
    }

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    debug!("Saved {} filters to {:?}", shards.len(), path);
    Ok(())
}

/// Restore matching filters from `path`; returns how many were restored
///
/// A missing file is not an error: every filter simply stays untrusted.
pub fn recover(path: &Path, shards: &[Arc<Shard>]) -> Result<usize> {
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Filter metadata {:?} not found; filters stay untrusted", path);
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    if buf.len() < HEADER_SIZE + CRC_SIZE {
        return Err(TierError::corruption(format!(
            "filter metadata {:?} truncated ({} bytes)",
            path,
            buf.len()
        )));
    }

    let (body, trailer) = buf.split_at(buf.len() - CRC_SIZE);
    let stored_crc = u32::from_le_bytes(read_array(trailer, 0)?);
    if crc32fast::hash(body) != stored_crc {
        return Err(TierError::corruption(format!(
            "filter metadata {:?} checksum mismatch",
            path
        )));
    }

    if &body[0..4] != MAGIC {
        return Err(TierError::corruption(format!(
            "filter metadata {:?} has bad magic",
            path
        )));
    }
    let version = u16::from_le_bytes(read_array(body, 4)?);
    if version != VERSION {
        return Err(TierError::corruption(format!(
            "filter metadata {:?} has unsupported version {}",
            path, version
        )));
    }

    let count = u32::from_le_bytes(read_array(body, 6)?) as usize;
    let filter_bytes = u32::from_le_bytes(read_array(body, 10)?) as usize;
    if count != shards.len() {
        return Err(TierError::corruption(format!(
            "filter metadata {:?} holds {} shards, table has {}",
            path,
            count,
            shards.len()
        )));
    }
    if body.len() != HEADER_SIZE + count * (SLOT_HEADER_SIZE + filter_bytes) {
        return Err(TierError::corruption(format!(
            "filter metadata {:?} has {} bytes, expected {}",
            path,
            buf.len(),
            HEADER_SIZE + count * (SLOT_HEADER_SIZE + filter_bytes) + CRC_SIZE
        )));
    }

    let mut restored = 0;
    let mut pos = HEADER_SIZE;
    for (index, shard) in shards.iter().enumerate() {
        let log_file_id = u64::from_le_bytes(read_array(body, pos)?);
        let log_bytes_used = u64::from_le_bytes(read_array(body, pos + 8)?);
        let bits = &body[pos + SLOT_HEADER_SIZE..pos + SLOT_HEADER_SIZE + filter_bytes];
        pos += SLOT_HEADER_SIZE + filter_bytes;

        if filter_bytes != shard.filter().byte_len() {
            warn!(
                "Filter metadata slot {} has {} bytes, shard filter has {}; skipping",
                index,
                filter_bytes,
                shard.filter().byte_len()
            );
            continue;
        }
        if log_file_id != shard.log_file_id() || log_bytes_used != shard.log_bytes_used() as u64 {
            warn!(
                "Filter metadata slot {} is stale (log {} / {} bytes, shard has log {} / {} bytes); skipping",
                index,
                log_file_id,
                log_bytes_used,
                shard.log_file_id(),
                shard.log_bytes_used()
            );
            continue;
        }

        shard.filter().restore(bits)?;
        restored += 1;
    }

    debug!("Restored {} of {} filters from {:?}", restored, shards.len(), path);
    Ok(restored)
}

fn read_array<const N: usize>(buf: &[u8], pos: usize) -> Result<[u8; N]> {
    buf.get(pos..pos + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| TierError::corruption("filter metadata truncated"))
}
