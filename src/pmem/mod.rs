//! Persistent Memory Module
//!
//! Memory-mapped files standing in for byte-addressable NVM.
//!
//! ## Responsibilities
//! - Create/open/size/map backing files (`MappedRegion`)
//! - Store-then-flush primitive for durability-critical updates
//! - Bump allocation with a persisted bytes-remaining header (`PersistentArena`)
//! - Append-only record storage addressed by offset (`PersistentLog`)
//!
//! ## Region Layouts
//! ```text
//! Index arena:  [remaining u64][last seq u64][max height i32][pad u32][nodes u64][head][nodes...]
//! Log:          [remaining u64][record][record]...
//! ```
//! Both regions are mapped at `growth × logical size`; everything past the
//! logical size is headroom that absorbs overshoot without remapping.
//!
//! ## Durability
//! Every stored offset is relative to the region start, so a region is valid
//! no matter where the OS maps it on the next start.

mod arena;
mod log;
mod region;

pub use arena::{PersistentArena, ARENA_ALIGN};
pub use log::{PersistentLog, LOG_HEADER_SIZE};
pub use region::MappedRegion;

/// Mapped length for a region of `logical` bytes with `growth` headroom,
/// rounded up to the arena alignment
pub(crate) fn mapped_len(logical: usize, growth: f64) -> usize {
    let scaled = (logical as f64 * growth).ceil() as usize;
    scaled.max(logical).div_ceil(ARENA_ALIGN) * ARENA_ALIGN
}
