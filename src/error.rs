//! Error types for nvtier
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using TierError
pub type Result<T> = std::result::Result<T, TierError>;

/// Unified error type for nvtier operations
#[derive(Debug, Error)]
pub enum TierError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing file could not be created, opened, truncated or mapped
    #[error("Mapping failed for {path:?}: {source}")]
    Mapping {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // -------------------------------------------------------------------------
    // Persistent Memory Errors
    // -------------------------------------------------------------------------
    /// Arena or log ran past its mapped headroom
    #[error("{region} out of space: requested {requested} bytes, {remaining} remaining")]
    OutOfSpace {
        region: &'static str,
        requested: usize,
        remaining: usize,
    },

    /// A persisted header scalar, link or record failed validation
    #[error("Corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Input Errors
    // -------------------------------------------------------------------------
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Shard index {index} out of range (table has {count} shards)")]
    InvalidShard { index: usize, count: usize },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Drain Errors
    // -------------------------------------------------------------------------
    #[error("Drain of shard {shard} failed: {reason}")]
    Drain { shard: usize, reason: String },

    /// The drain could not run its sinks at all
    #[error("Drain aborted: {0}")]
    DrainAborted(String),

    #[cfg(test)]
    #[error("Injected crash")]
    InjectedCrash,
}

impl TierError {
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        TierError::Corruption(msg.into())
    }
}
