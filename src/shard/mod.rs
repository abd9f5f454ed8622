//! Shard Module
//!
//! A shard pairs one persistent skip index with one persistent log and a
//! DRAM membership filter.
//!
//! ## Write Path
//! ```text
//! add(record)
//!     │
//!     ├──► log.append(record)          ──► offset
//!     ├──► index.add(internal key, offset, seq)
//!     └──► filter.insert(user key)
//! ```
//!
//! ## Read Path
//! ```text
//! get(user key, snapshot)
//!     │
//!     ├──► filter says no? ──► NotFound
//!     ├──► index.seek(user key + snapshot tag)
//!     └──► same user key, seq ≤ snapshot? ──► Found / Deleted / NotFound
//! ```

mod core;
mod filter;
mod iterator;

pub use self::core::{Lookup, Shard, ShardFiles};
pub use filter::MembershipFilter;
pub use iterator::ShardIterator;
