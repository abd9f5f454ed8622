//! Key comparators
//!
//! The index orders entries by internal key; `get` confirms matches by user key.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::record::{extract_user_key, read_tag};

/// Ordering over user keys, supplied by the surrounding engine
pub trait UserComparator: Send + Sync + fmt::Debug {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    fn name(&self) -> &'static str;
}

/// Lexicographic byte ordering
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl UserComparator for BytewiseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn name(&self) -> &'static str {
        "nvtier.BytewiseComparator"
    }
}

/// Orders internal keys: user key ascending, then tag (sequence) descending
#[derive(Debug, Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn UserComparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn UserComparator>) -> Self {
        Self { user }
    }

    pub fn bytewise() -> Self {
        Self::new(Arc::new(BytewiseComparator))
    }

    pub fn user_comparator(&self) -> &dyn UserComparator {
        self.user.as_ref()
    }

    /// Full internal key ordering
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.compare_user(a, b)
            .then_with(|| read_tag(b).cmp(&read_tag(a)))
    }

    /// Compare only the user key portions of two internal keys
    pub fn compare_user(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user.compare(extract_user_key(a), extract_user_key(b))
    }

    /// True when two internal keys carry the same user key
    pub fn user_equal(&self, a: &[u8], b: &[u8]) -> bool {
        self.compare_user(a, b) == Ordering::Equal
    }
}

impl Default for InternalKeyComparator {
    fn default() -> Self {
        Self::bytewise()
    }
}
