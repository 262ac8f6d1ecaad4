//! Pollard-rho factorization of the 64-bit `pq` sent in `resPQ`.

use crate::fill_random;

/// Binary gcd. `b` must be odd.
fn pq_gcd(mut a: u64, mut b: u64) -> u64 {
    if a == 0 {
        return b;
    }
    while a & 1 == 0 {
        a >>= 1;
    }
    loop {
        if a > b {
            a = (a - b) >> 1;
            while a & 1 == 0 {
                a >>= 1;
            }
        } else if b > a {
            b = (b - a) >> 1;
            while b & 1 == 0 {
                b >>= 1;
            }
        } else {
            return a;
        }
    }
}

/// `(c + a * b) mod pq` without overflowing; all inputs are below `pq <= 2^63`.
fn pq_add_mul(mut c: u64, mut a: u64, mut b: u64, pq: u64) -> u64 {
    while b != 0 {
        if b & 1 != 0 {
            c += a;
            if c >= pq {
                c -= pq;
            }
        }
        a += a;
        if a >= pq {
            a -= pq;
        }
        b >>= 1;
    }
    c
}

fn random_u64() -> u64 {
    let mut buf = [0u8; 8];
    fill_random(&mut buf);
    u64::from_le_bytes(buf)
}

/// Smallest non-trivial factor of `pq`, or 1 when none was found.
fn pq_factorize(pq: u64) -> u64 {
    if pq <= 2 || pq > 1 << 63 {
        return 1;
    }
    if pq & 1 == 0 {
        return 2;
    }

    let mut g = 0u64;
    let mut i = 0u32;
    let mut iter = 0u32;
    while i < 3 || iter < 1000 {
        let q = (17 + random_u64() % 16) % (pq - 1);
        let mut x = random_u64() % (pq - 1) + 1;
        let mut y = x;
        let lim = 1u64 << (i.min(5) + 18);
        for j in 1..lim {
            iter += 1;
            x = pq_add_mul(q, x, x, pq);
            let z = if x < y { pq + x - y } else { x - y };
            g = pq_gcd(z, pq);
            if g != 1 {
                break;
            }
            if j & (j - 1) == 0 {
                y = x;
            }
        }
        if g > 1 && g < pq {
            break;
        }
        i += 1;
    }

    if g != 0 {
        g = g.min(pq / g);
    }
    g
}

/// Split `pq` into `(p, q)` with `p <= q`, or `None` if no factor was found.
pub fn factorize(pq: u64) -> Option<(u64, u64)> {
    match pq_factorize(pq) {
        0 | 1 => None,
        p => Some((p, pq / p)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factors_known_products() {
        assert_eq!(factorize(1470626929934143021), Some((1206429347, 1218991343)));
        assert_eq!(factorize(2363612107535801713), Some((1518968219, 1556064227)));
    }

    #[test]
    fn even_and_tiny_inputs() {
        assert_eq!(factorize(2 * 1_000_003), Some((2, 1_000_003)));
        assert_eq!(factorize(1), None);
    }

    #[test]
    fn prime_has_no_factor() {
        assert_eq!(factorize(1_000_000_007), None);
    }

    #[test]
    fn gcd_matches_euclid() {
        assert_eq!(pq_gcd(12, 9), 3);
        assert_eq!(pq_gcd(0, 15), 15);
        assert_eq!(pq_gcd(35, 21), 7);
    }

    #[test]
    fn add_mul_reduces() {
        assert_eq!(pq_add_mul(3, 5, 7, 11), (3 + 35) % 11);
    }
}
