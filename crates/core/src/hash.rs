//! Seeded hashing for strings and the per-variant value mixes.
//!
//! String hashes are salted with a per-state seed so that hostile input
//! cannot aim for bucket collisions in the interner or in tables. The seed
//! comes from the process RNG at state creation.

const FNV_OFFSET: u32 = 2166136261;
const FNV_PRIME: u32 = 16777619;

/// Seeded FNV-1a over a byte string. Computed once per string and cached
/// in the string object.
#[inline]
pub fn hash_bytes(bytes: &[u8], seed: u32) -> u32 {
    let mut h = FNV_OFFSET ^ seed;
    for &b in bytes {
        h ^= b as u32;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Integer mix (Fibonacci hashing folded to 32 bits).
#[inline]
pub fn hash_int(i: i64) -> u32 {
    let h = (i as u64).wrapping_mul(0x9E3779B97F4A7C15);
    (h >> 32) as u32 ^ h as u32
}

/// Float mix: floats holding an exact integer hash like that integer, so
/// `t[2]` and `t[2.0]` land in the same bucket; everything else mixes the
/// bit pattern.
#[inline]
pub fn hash_float(f: f64) -> u32 {
    if f as i64 as f64 == f && f.is_finite() {
        hash_int(f as i64)
    } else {
        hash_int(f.to_bits() as i64)
    }
}

/// Handle (object identity) mix.
#[inline]
pub fn hash_handle(h: u32) -> u32 {
    hash_int(h as i64)
}

/// Fresh hash seed for a new interpreter state.
pub fn make_seed() -> u32 {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_seed_same_hash() {
        let h1 = hash_bytes(b"metamethod", 0xDEAD);
        let h2 = hash_bytes(b"metamethod", 0xDEAD);
        assert_eq!(h1, h2);
        assert_ne!(h1, hash_bytes(b"metamethod", 0xBEEF));
    }

    #[test]
    fn exact_float_hashes_like_int() {
        assert_eq!(hash_float(2.0), hash_int(2));
        assert_eq!(hash_float(-7.0), hash_int(-7));
        assert_ne!(hash_float(2.5), hash_int(2));
    }
}
