//! Format Module
//!
//! Byte-level encodings shared by the log, the index and callers.
//!
//! ## Internal Key
//! ```text
//! ┌──────────────────────┬──────────────────────────────────┐
//! │ User Key (variable)  │ Tag: u64 LE = seq << 8 | kind    │
//! └──────────────────────┴──────────────────────────────────┘
//! ```
//! Internal keys sort by user key ascending, then tag descending, so the
//! newest version of a key comes first.
//!
//! ## Log Record
//! ```text
//! ┌───────────────┬──────────────┬─────────────────┬─────────────┐
//! │ varint32 klen │ Internal Key │ varint32 vlen   │ Value       │
//! └───────────────┴──────────────┴─────────────────┴─────────────┘
//! ```
//! The value part is omitted for deletions.

mod comparator;
mod record;

pub use comparator::{BytewiseComparator, InternalKeyComparator, UserComparator};
pub use record::{
    decode_varint32, encode_record, encode_varint32, extract_user_key, lookup_key, pack_tag,
    parse_internal_key, unpack_tag, RecordRef, SequenceNumber, ValueKind, MAX_SEQUENCE, TAG_SIZE,
};
