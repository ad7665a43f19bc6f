//! Prime search for the coefficient-modulus chain.
//!
//! Every modulus in the chain is an NTT-friendly prime `p = 1 (mod 2n)` with
//! exactly the requested bit size. Primes of equal bit size are taken in
//! descending order so the chain never repeats a modulus.
//!
//! Primality uses deterministic Miller-Rabin on `u64`: `n - 1 = d * 2^r`, and
//! each fixed base must either hit `1`/`n - 1` on `a^d` or reach `n - 1` by
//! repeated squaring.

use std::collections::HashMap;

// Deterministic for all n < 3.3 * 10^24, which covers u64.
const MILLER_RABIN_BASES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

/// Largest bit size accepted for a single modulus.
pub const MAX_MODULUS_BITS: u32 = 60;
/// Smallest bit size accepted for a single modulus.
pub const MIN_MODULUS_BITS: u32 = 2;

fn mul_mod(a: u64, b: u64, modulus: u64) -> u64 {
    assert!(modulus > 0, "mul_mod: modulus must be positive");
    ((a as u128 * b as u128) % modulus as u128) as u64
}

fn mod_pow(mut base: u64, mut exp: u64, modulus: u64) -> u64 {
    assert!(modulus > 0, "mod_pow: modulus must be positive");
    let mut acc = 1 % modulus;
    base %= modulus;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = mul_mod(acc, base, modulus);
        }
        base = mul_mod(base, base, modulus);
        exp >>= 1;
    }
    acc
}

/// Returns `true` if `n` is prime.
pub fn is_prime(n: u64) -> bool {
    match n {
        0 | 1 => return false,
        2 | 3 => return true,
        _ if n & 1 == 0 => return false,
        _ => {}
    }

    let r = (n - 1).trailing_zeros();
    let d = (n - 1) >> r;
    'bases: for &a in MILLER_RABIN_BASES.iter() {
        if a >= n {
            continue;
        }
        let mut x = mod_pow(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..r {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'bases;
            }
        }
        return false;
    }
    true
}

/// `p` is prime and `2n` divides `p - 1`.
#[inline]
pub fn is_ntt_friendly_prime(p: u64, n: u64) -> bool {
    n > 0 && is_prime(p) && p % (2 * n) == 1
}

/// Returns the largest NTT-friendly prime strictly below `bound`, or `None`
/// if the search runs below `floor`.
pub fn prime_below(bound: u64, floor: u64, n: u64) -> Option<u64> {
    let step = n.checked_mul(2)?;
    if bound <= step {
        return None;
    }
    // Largest x < bound with x = 1 (mod 2n).
    let top = bound - 1;
    let mut candidate = top - (top + step - 1) % step;
    while candidate > floor {
        if is_prime(candidate) {
            return Some(candidate);
        }
        candidate = candidate.checked_sub(step)?;
    }
    None
}

/// Builds the coefficient-modulus chain for ring degree `n`, one prime per
/// entry of `bit_sizes`, in the same order.
///
/// Returns `None` if a bit size is out of range or runs out of primes.
pub fn coeff_modulus_primes(n: u64, bit_sizes: &[u32]) -> Option<Vec<u64>> {
    let mut next_bound: HashMap<u32, u64> = HashMap::new();
    let mut primes = Vec::with_capacity(bit_sizes.len());
    for &bits in bit_sizes {
        if !(MIN_MODULUS_BITS..=MAX_MODULUS_BITS).contains(&bits) {
            return None;
        }
        let bound = *next_bound.get(&bits).unwrap_or(&(1u64 << bits));
        let prime = prime_below(bound, 1u64 << (bits - 1), n)?;
        next_bound.insert(bits, prime);
        primes.push(prime);
    }
    Some(primes)
}
