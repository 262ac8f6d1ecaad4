//! Diffie-Hellman group validation with a shared verdict cache.
//!
//! Servers reuse the same 2048-bit safe prime almost always, so the
//! expensive primality checks run once per prime and the result is shared
//! by every connection holding the same [`DhPrimeCache`].

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use num_bigint::BigUint;
use num_traits::One;
use telecore_crypto::is_probable_prime;

use crate::authentication::Error;

/// Miller-Rabin certainty used for unknown primes.
pub const PRIME_CERTAINTY: u32 = 64;

/// The well-known group the servers hand out.
const BUILTIN_GOOD_PRIME: &str = concat!(
    "c71caeb9c6b1c9048e6c522f70f13f73980d40238e3e21c14934d037563d930f",
    "48198a0aa7c14058229493d22530f4dbfa336f6e0ac925139543aed44cce7c37",
    "20fd51f69458705ac68cd4fe6b6b13abdc9746512969328454f18faf8c595f64",
    "2477fe96bb2a941d5bcd1d4ac8cc49880708fa9b378e3c4f3a9060bee67cf9a4",
    "a4a695811051907e162753b56b0f6b410dba74d8a84b2a14b3144e0ef1284754",
    "fd17ed950d5965b4b9dd46582db1178d169c6bc465b0d6ff9ca3928fef5b9ae4",
    "e418fc15e83ebea0f87fa9ff5eed70050ded2849f47bf959d956850ce929851f",
    "0d8115f635b105ee2e4e15d04b2454bf6f4fadf034b10403119cd8e3b92fcc5b",
);

/// Big-endian bytes of the built-in prime.
pub fn builtin_prime() -> Vec<u8> {
    BigUint::parse_bytes(BUILTIN_GOOD_PRIME.as_bytes(), 16)
        .map(|p| p.to_bytes_be())
        .unwrap_or_default()
}

/// Primes already classified as safe (`p` and `(p-1)/2` prime) or unsafe.
#[derive(Debug, Default)]
pub struct DhPrimeCache {
    good: RwLock<HashSet<Vec<u8>>>,
    bad: RwLock<HashSet<Vec<u8>>>,
}

impl DhPrimeCache {
    /// A cache that already trusts the built-in prime.
    pub fn new() -> Self {
        let cache = Self::empty();
        cache.add_good(builtin_prime());
        cache
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn add_good(&self, prime: Vec<u8>) {
        self.good.write().unwrap_or_else(PoisonError::into_inner).insert(prime);
    }

    pub fn add_bad(&self, prime: Vec<u8>) {
        self.bad.write().unwrap_or_else(PoisonError::into_inner).insert(prime);
    }

    pub fn is_good(&self, prime: &[u8]) -> bool {
        self.good.read().unwrap_or_else(PoisonError::into_inner).contains(prime)
    }

    pub fn is_bad(&self, prime: &[u8]) -> bool {
        self.bad.read().unwrap_or_else(PoisonError::into_inner).contains(prime)
    }

    /// Validate the group `(prime, g)` sent in `server_DH_inner_data`.
    pub fn check(&self, prime: &[u8], g: i32) -> Result<(), Error> {
        let p = BigUint::from_bytes_be(prime);
        let bits = p.bits();
        if bits != 2048 {
            return Err(Error::InvalidDhPrimeLength { bits });
        }
        if !(2..=7).contains(&g) {
            return Err(Error::InvalidGenerator { g });
        }
        if !residue_ok(&p, g as u32) {
            return Err(Error::GeneratorNotResidue { g });
        }

        if self.is_bad(prime) {
            return Err(Error::UnsafeDhPrime);
        }
        if self.is_good(prime) {
            return Ok(());
        }

        let half = (&p - BigUint::one()) >> 1u32;
        if is_probable_prime(&p, PRIME_CERTAINTY) && is_probable_prime(&half, PRIME_CERTAINTY) {
            log::debug!("[dh] new safe prime accepted after primality check");
            self.add_good(prime.to_vec());
            Ok(())
        } else {
            log::warn!("[dh] server offered an unsafe prime");
            self.add_bad(prime.to_vec());
            Err(Error::UnsafeDhPrime)
        }
    }
}

/// `g` must generate the subgroup of order `(p-1)/2`, which reduces to a
/// congruence on `p` for each small generator.
fn residue_ok(p: &BigUint, g: u32) -> bool {
    let rem = |m: u32| -> u32 {
        (p % m).iter_u32_digits().next().unwrap_or(0)
    };
    match g {
        2 => rem(8) == 7,
        3 => rem(3) == 2,
        4 => true,
        5 => matches!(rem(5), 1 | 4),
        6 => matches!(rem(24), 19 | 23),
        7 => matches!(rem(7), 3 | 5 | 6),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_prime_is_trusted() {
        let cache = DhPrimeCache::new();
        let prime = builtin_prime();
        assert_eq!(prime.len(), 256);
        assert!(cache.is_good(&prime));
        cache.check(&prime, 3).unwrap();
    }

    #[test]
    fn generator_residues_for_builtin_prime() {
        let p = BigUint::from_bytes_be(&builtin_prime());
        let accepted: Vec<u32> = (2..=7).filter(|&g| residue_ok(&p, g)).collect();
        assert_eq!(accepted, vec![3, 4, 7]);
    }

    #[test]
    fn rejects_bad_groups() {
        let cache = DhPrimeCache::new();
        let prime = builtin_prime();
        assert_eq!(cache.check(&prime, 2), Err(Error::GeneratorNotResidue { g: 2 }));
        assert_eq!(cache.check(&prime, 9), Err(Error::InvalidGenerator { g: 9 }));
        assert!(matches!(
            cache.check(&prime[1..], 3),
            Err(Error::InvalidDhPrimeLength { .. })
        ));
    }

    #[test]
    fn unknown_composite_is_cached_as_bad() {
        let cache = DhPrimeCache::empty();
        // 2^2047 + 1 is divisible by 3; g = 4 has no congruence to fail first.
        let p: BigUint = (BigUint::one() << 2047u32) + BigUint::one();
        let bytes = p.to_bytes_be();
        assert_eq!(cache.check(&bytes, 4), Err(Error::UnsafeDhPrime));
        assert!(cache.is_bad(&bytes));
    }
}
