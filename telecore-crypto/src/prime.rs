//! Probabilistic primality test for DH parameters.

use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::fill_random;

/// Uniform-ish random value in `[low, high)`. The modulo bias is negligible
/// at the 2048-bit sizes this is used with.
fn random_below(low: &BigUint, high: &BigUint) -> BigUint {
    let span = high - low;
    let mut bytes = vec![0u8; (span.bits() as usize).div_ceil(8) + 8];
    fill_random(&mut bytes);
    low + BigUint::from_bytes_be(&bytes) % span
}

/// Miller-Rabin with `(certainty + 1) / 2` random witnesses. A composite
/// passes with probability below `2^-certainty`.
pub fn is_probable_prime(n: &BigUint, certainty: u32) -> bool {
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    for small in [2u32, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        let small = BigUint::from(small);
        if *n == small {
            return true;
        }
        if (n % &small).is_zero() {
            return false;
        }
    }

    let one = BigUint::one();
    let n_minus_one = n - &one;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    let rounds = certainty.div_ceil(2).max(1);
    'witness: for _ in 0..rounds {
        let a = random_below(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
            if x == one {
                return false;
            }
        }
        return false;
    }
    true
}
