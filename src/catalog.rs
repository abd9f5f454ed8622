//! Catalog
//!
//! Small checksummed file naming the files that back each shard slot.
//!
//! ```text
//! ┌─────────────┬─────────────┬──────────────────────────────┐
//! │ len: u32 LE │ crc32: u32  │ bincode(CatalogState)        │
//! └─────────────┴─────────────┴──────────────────────────────┘
//! ```
//!
//! Written to a temp file and renamed over the old one, so a crash leaves
//! either the previous or the new catalog.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::OverwritePolicy;
use crate::error::{Result, TierError};
use crate::format::SequenceNumber;

const FRAME_HEADER: usize = 8;

/// File ids backing one shard slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub index_file_id: u64,
    pub log_file_id: u64,
}

/// Everything the engine needs to reattach to its shards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogState {
    /// Next unused file id
    pub next_file_id: u64,

    /// Highest sequence number known when the catalog was written
    pub last_sequence: SequenceNumber,

    /// Policy every index in the directory was built with
    pub overwrite_policy: OverwritePolicy,

    /// One entry per shard slot, in slot order
    pub shards: Vec<ShardEntry>,
}

impl CatalogState {
    pub fn new(overwrite_policy: OverwritePolicy) -> Self {
        Self {
            next_file_id: 1,
            last_sequence: 0,
            overwrite_policy,
            shards: Vec::new(),
        }
    }

    /// Reserve a fresh file id
    pub fn allocate_file_id(&mut self) -> u64 {
        let id = self.next_file_id;
        self.next_file_id += 1;
        id
    }

    /// Read a catalog; `Ok(None)` if the file does not exist
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let buf = match fs::read(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if buf.len() < FRAME_HEADER {
            return Err(TierError::corruption(format!(
                "catalog {:?} truncated ({} bytes)",
                path,
                buf.len()
            )));
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let body = &buf[FRAME_HEADER..];
        if body.len() != len {
            return Err(TierError::corruption(format!(
                "catalog {:?} body is {} bytes, header says {}",
                path,
                body.len(),
                len
            )));
        }
        if crc32fast::hash(body) != crc {
            return Err(TierError::corruption(format!(
                "catalog {:?} checksum mismatch",
                path
            )));
        }

        let state =
            bincode::deserialize(body).map_err(|e| TierError::Serialization(e.to_string()))?;
        Ok(Some(state))
    }

    /// Atomically replace the catalog at `path`
    pub fn store(&self, path: &Path) -> Result<()> {
        let body = bincode::serialize(self).map_err(|e| TierError::Serialization(e.to_string()))?;

        let mut buf = Vec::with_capacity(FRAME_HEADER + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buf.extend_from_slice(&body);

        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Default for CatalogState {
    fn default() -> Self {
        Self::new(OverwritePolicy::MultiVersion)
    }
}
