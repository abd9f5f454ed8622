//! Key → shard routing

use xxhash_rust::xxh64::xxh64;

const PARTITION_SEED: u64 = 0x6e76_7469_6572;

/// Shard index for `user_key` in a table of `num_shards` (a power of two)
///
/// Uses the top `log2(num_shards)` bits of the key's hash. Pure: the same key
/// and count always give the same shard, in every process.
pub fn partition(user_key: &[u8], num_shards: usize) -> usize {
    debug_assert!(num_shards.is_power_of_two());
    if num_shards <= 1 {
        return 0;
    }
    let bits = num_shards.trailing_zeros();
    (xxh64(user_key, PARTITION_SEED) >> (64 - bits)) as usize
}
