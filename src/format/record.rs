//! Record encoding
//!
//! Internal keys, tags and the varint-framed records stored in the log.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TierError};

/// Monotonic sequence number assigned to every mutation
pub type SequenceNumber = u64;

/// Largest sequence number that fits in a tag (56 bits)
pub const MAX_SEQUENCE: SequenceNumber = (1 << 56) - 1;

/// Size of the tag trailing every internal key
pub const TAG_SIZE: usize = 8;

const MAX_VARINT32_LEN: usize = 5;

/// Mutation kind stored in the low byte of a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    Deletion = 0x0,
    Value = 0x1,
}

impl ValueKind {
    /// Highest kind, so a lookup key sorts before every entry with the same sequence
    pub(crate) const FOR_SEEK: ValueKind = ValueKind::Value;

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(ValueKind::Deletion),
            0x1 => Some(ValueKind::Value),
            _ => None,
        }
    }
}

/// Pack a sequence number and kind into a tag
pub fn pack_tag(sequence: SequenceNumber, kind: ValueKind) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE);
    (sequence << 8) | kind as u64
}

/// Split a tag into its sequence number and kind
pub fn unpack_tag(tag: u64) -> Result<(SequenceNumber, ValueKind)> {
    let kind = ValueKind::from_byte((tag & 0xff) as u8).ok_or_else(|| {
        TierError::InvalidRecord(format!("unknown value kind {:#x}", tag & 0xff))
    })?;
    Ok((tag >> 8, kind))
}

/// Read the trailing tag of an internal key (0 if the key is too short)
pub(crate) fn read_tag(internal_key: &[u8]) -> u64 {
    if internal_key.len() < TAG_SIZE {
        return 0;
    }
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&internal_key[internal_key.len() - TAG_SIZE..]);
    u64::from_le_bytes(tag)
}

/// The user key portion of an internal key
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    &internal_key[..internal_key.len().saturating_sub(TAG_SIZE)]
}

/// Split an internal key into user key, sequence number and kind
pub fn parse_internal_key(internal_key: &[u8]) -> Result<(&[u8], SequenceNumber, ValueKind)> {
    if internal_key.len() < TAG_SIZE {
        return Err(TierError::InvalidRecord(format!(
            "internal key of {} bytes is shorter than its tag",
            internal_key.len()
        )));
    }
    let (sequence, kind) = unpack_tag(read_tag(internal_key))?;
    Ok((extract_user_key(internal_key), sequence, kind))
}

/// Internal key that seeks to the newest entry for `user_key` visible at `snapshot`
pub fn lookup_key(user_key: &[u8], snapshot: SequenceNumber) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_key.len() + TAG_SIZE);
    key.extend_from_slice(user_key);
    key.extend_from_slice(&pack_tag(snapshot.min(MAX_SEQUENCE), ValueKind::FOR_SEEK).to_le_bytes());
    key
}

// =============================================================================
// Varint
// =============================================================================

/// Append `value` as a LEB128 varint
pub fn encode_varint32(buf: &mut impl BufMut, mut value: u32) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decode a varint from the front of `input`, returning (value, bytes consumed)
pub fn decode_varint32(input: &[u8]) -> Option<(u32, usize)> {
    let mut result: u32 = 0;
    for (i, &byte) in input.iter().take(MAX_VARINT32_LEN).enumerate() {
        if i == MAX_VARINT32_LEN - 1 && byte > 0x0f {
            return None;
        }
        result |= ((byte & 0x7f) as u32) << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
    }
    None
}

// =============================================================================
// Records
// =============================================================================

/// Encode one log record
///
/// Deletions carry no value part; `value` is ignored for them.
pub fn encode_record(
    user_key: &[u8],
    sequence: SequenceNumber,
    kind: ValueKind,
    value: &[u8],
) -> Result<Bytes> {
    if sequence > MAX_SEQUENCE {
        return Err(TierError::InvalidRecord(format!(
            "sequence {} exceeds maximum {}",
            sequence, MAX_SEQUENCE
        )));
    }
    let internal_len = u32::try_from(user_key.len() + TAG_SIZE)
        .map_err(|_| TierError::InvalidRecord("user key too large".to_string()))?;
    let value_len = u32::try_from(value.len())
        .map_err(|_| TierError::InvalidRecord("value too large".to_string()))?;

    let mut buf = BytesMut::with_capacity(
        2 * MAX_VARINT32_LEN + internal_len as usize + value.len(),
    );
    encode_varint32(&mut buf, internal_len);
    buf.put_slice(user_key);
    buf.put_u64_le(pack_tag(sequence, kind));
    if kind == ValueKind::Value {
        encode_varint32(&mut buf, value_len);
        buf.put_slice(value);
    }
    Ok(buf.freeze())
}

/// Borrowed view of one decoded record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef<'a> {
    /// User key followed by the 8-byte tag
    pub internal_key: &'a [u8],
    /// Empty for deletions
    pub value: &'a [u8],
    pub sequence: SequenceNumber,
    pub kind: ValueKind,
    /// Bytes the record occupies in its encoded form
    pub encoded_len: usize,
}

impl<'a> RecordRef<'a> {
    /// Decode the record at the start of `buf`
    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        let (key_len, mut pos) = decode_varint32(buf)
            .ok_or_else(|| TierError::InvalidRecord("bad internal key length".to_string()))?;
        let key_len = key_len as usize;
        if key_len < TAG_SIZE {
            return Err(TierError::InvalidRecord(format!(
                "internal key of {} bytes is shorter than its tag",
                key_len
            )));
        }
        let internal_key = buf
            .get(pos..pos + key_len)
            .ok_or_else(|| TierError::InvalidRecord("truncated internal key".to_string()))?;
        pos += key_len;

        let (sequence, kind) = unpack_tag(read_tag(internal_key))?;

        let value: &[u8] = match kind {
            ValueKind::Deletion => &[],
            ValueKind::Value => {
                let (value_len, n) = decode_varint32(&buf[pos..])
                    .ok_or_else(|| TierError::InvalidRecord("bad value length".to_string()))?;
                pos += n;
                let value = buf
                    .get(pos..pos + value_len as usize)
                    .ok_or_else(|| TierError::InvalidRecord("truncated value".to_string()))?;
                pos += value_len as usize;
                value
            }
        };

        Ok(Self {
            internal_key,
            value,
            sequence,
            kind,
            encoded_len: pos,
        })
    }

    pub fn user_key(&self) -> &'a [u8] {
        extract_user_key(self.internal_key)
    }

    pub fn is_deletion(&self) -> bool {
        self.kind == ValueKind::Deletion
    }
}
