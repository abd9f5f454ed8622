//! Tests for MembershipFilter

use nvtier::shard::MembershipFilter;
use nvtier::TierError;

// =============================================================================
// Helper Functions
// =============================================================================

fn keys(prefix: &str, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("{}{:06}", prefix, i).into_bytes())
        .collect()
}

// =============================================================================
// Membership Tests
// =============================================================================

#[test]
fn test_no_false_negatives() {
    let filter = MembershipFilter::new(8192, 4);
    let inserted = keys("present", 1000);
    for key in &inserted {
        filter.insert(key);
    }
    for key in &inserted {
        assert!(filter.may_contain(key));
    }
}

#[test]
fn test_false_positives_are_rare() {
    let filter = MembershipFilter::new(8192, 4);
    for key in keys("present", 500) {
        filter.insert(&key);
    }

    let false_positives = keys("absent", 10_000)
        .iter()
        .filter(|key| filter.may_contain(key))
        .count();
    assert!(false_positives < 300, "{} false positives", false_positives);
}

#[test]
fn test_empty_filter_rejects_everything() {
    let filter = MembershipFilter::new(1024, 3);
    assert!(filter.is_trusted());
    assert!(!filter.may_contain(b"anything"));
    assert!(!filter.may_contain(b""));
}

#[test]
fn test_untrusted_filter_passes_every_key() {
    let filter = MembershipFilter::untrusted(1024, 3);
    assert!(!filter.is_trusted());
    assert!(filter.may_contain(b"never inserted"));
}

#[test]
fn test_size_rounds_up_to_whole_words() {
    let filter = MembershipFilter::new(100, 2);
    assert_eq!(filter.num_bits(), 128);
    assert_eq!(filter.byte_len(), 16);
    assert_eq!(filter.hash_count(), 2);
}

// =============================================================================
// Restore Tests
// =============================================================================

#[test]
fn test_restore_makes_filter_trusted() {
    let saved = MembershipFilter::new(2048, 4);
    for key in keys("k", 50) {
        saved.insert(&key);
    }
    let image = saved.to_bytes();
    assert_eq!(image.len(), saved.byte_len());

    let restored = MembershipFilter::untrusted(2048, 4);
    restored.insert(b"inserted-before-restore");
    restored.restore(&image).unwrap();

    assert!(restored.is_trusted());
    for key in keys("k", 50) {
        assert!(restored.may_contain(&key));
    }
    // Bits set before the restore are kept.
    assert!(restored.may_contain(b"inserted-before-restore"));
}

#[test]
fn test_restore_rejects_wrong_size() {
    let filter = MembershipFilter::untrusted(2048, 4);
    let err = filter.restore(&[0u8; 16]).unwrap_err();
    assert!(matches!(err, TierError::Corruption(_)));
    assert!(!filter.is_trusted());
}
