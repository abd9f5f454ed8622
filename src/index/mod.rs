//! Index Module
//!
//! Crash-consistent ordered skip index stored in a persistent arena.
//!
//! ## Design
//! - Links are self-relative (`node − neighbour`), so the arena can be mapped
//!   at any address on the next start.
//! - One writer at a time; readers never lock. A node is fully initialised and
//!   flushed before the first release store makes it reachable.
//! - Header scalars (bytes remaining, last sequence, max height, node count)
//!   are the only state read at recovery; nothing is scanned.
//!
//! ## Insertion
//! ```text
//! allocate ─► init + flush node ─► flush arena remaining
//!     ─► for level in 0..h: pred.next[level] = node (release) + flush
//!     ─► update + flush header scalars
//! ```

mod node;
mod skiplist;

pub use node::{BRANCHING, HEADER_SIZE, HEAD_OFFSET, MAX_HEIGHT};
pub use skiplist::{AddOutcome, IndexIter, SkipIndex};

#[cfg(test)]
pub(crate) use skiplist::CrashPoint;
