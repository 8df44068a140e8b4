const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a of the key bytes, masked to a non-negative 31-bit value.
pub fn ihash(key: &str) -> u32 {
    let hash = key.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    });
    hash & 0x7fff_ffff
}

/// Reduce partition for `key`. Map writers and reduce readers both route
/// through here, so a key always lands in exactly one partition.
pub fn partition(key: &str, n_reduce: usize) -> usize {
    debug_assert!(n_reduce >= 1, "n_reduce must be at least 1");
    ihash(key) as usize % n_reduce
}
