use std::hash::BuildHasher;

/// Checks if a u64 value is a power of two.
#[inline]
pub fn is_power_of_two(x: u64) -> bool {
    x > 0 && (x & (x - 1)) == 0
}

/// Rounds `size` up to the next multiple of `alignment` (a power of two).
#[inline]
pub fn pad_alignment(size: usize, alignment: usize) -> usize {
    debug_assert!(is_power_of_two(alignment as u64));
    let max_padding = alignment - 1;
    (size + max_padding) & !max_padding
}

/// Rounds a byte size up to the 8-byte record granularity.
#[inline]
pub fn pad8(size: u32) -> u32 {
    pad_alignment(size as usize, 8) as u32
}

// Fixed seeds so key hashes survive a process restart; recovery rebuilds the
// index with the same bucket placement the image was taken under.
const K_HASH_SEEDS: [u64; 4] = [
    0x9e37_79b9_7f4a_7c15,
    0xd1b5_4a32_d192_ed03,
    0x8f14_e45f_ceea_167a,
    0x2545_f491_4f6c_dd1d,
];

/// Hashes a byte slice with a stable, cross-process-deterministic hasher.
#[inline]
pub fn stable_hash_bytes(data: &[u8]) -> u64 {
    let state = ahash::RandomState::with_seeds(
        K_HASH_SEEDS[0],
        K_HASH_SEEDS[1],
        K_HASH_SEEDS[2],
        K_HASH_SEEDS[3],
    );
    state.hash_one(data)
}
