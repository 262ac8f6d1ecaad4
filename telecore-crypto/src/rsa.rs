//! RSA public keys used to wrap the `p_q_inner_data` of the handshake.

use std::collections::HashMap;

use num_bigint::BigUint;

use crate::{fill_random, sha1};

/// An RSA public key (n, e).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    n: BigUint,
    e: BigUint,
}

impl Key {
    /// Parse decimal `n` and `e` strings.
    pub fn new(n: &str, e: &str) -> Option<Self> {
        Some(Self {
            n: BigUint::parse_bytes(n.as_bytes(), 10)?,
            e: BigUint::parse_bytes(e.as_bytes(), 10)?,
        })
    }

    pub fn from_parts(n: BigUint, e: BigUint) -> Self {
        Self { n, e }
    }

    /// Lower 64 bits of `SHA1(bytes(n) || bytes(e))`, where `bytes` is the
    /// TL string encoding of the big-endian magnitude.
    pub fn fingerprint(&self) -> i64 {
        let mut buf = Vec::with_capacity(270);
        tl_bytes(&self.n.to_bytes_be(), &mut buf);
        tl_bytes(&self.e.to_bytes_be(), &mut buf);
        let sha = sha1!(&buf);
        let mut fp = [0u8; 8];
        fp.copy_from_slice(&sha[12..20]);
        i64::from_le_bytes(fp)
    }

    /// Raw modular exponentiation, left-padded to 256 bytes.
    fn apply(&self, block: &[u8]) -> Vec<u8> {
        let out = BigUint::from_bytes_be(block).modpow(&self.e, &self.n).to_bytes_be();
        let mut padded = vec![0u8; 256usize.saturating_sub(out.len())];
        padded.extend_from_slice(&out);
        padded
    }
}

fn tl_bytes(data: &[u8], out: &mut Vec<u8>) {
    let header = if data.len() < 254 {
        out.push(data.len() as u8);
        1
    } else {
        out.push(254);
        out.extend_from_slice(&(data.len() as u32).to_le_bytes()[..3]);
        4
    };
    out.extend_from_slice(data);
    let pad = (4 - (header + data.len()) % 4) % 4;
    out.extend(std::iter::repeat_n(0u8, pad));
}

/// Largest payload [`encrypt_hashed`] accepts: 255 bytes minus the SHA-1.
pub const MAX_HASHED_PAYLOAD: usize = 255 - 20;

/// Encrypt `SHA1(data) || data || random` (255 bytes) with `key`.
///
/// Returns `None` when `data` does not fit.
pub fn encrypt_hashed(data: &[u8], key: &Key) -> Option<Vec<u8>> {
    let mut random = [0u8; 255];
    fill_random(&mut random);
    encrypt_hashed_with(data, key, &random)
}

/// [`encrypt_hashed`] with caller-supplied padding bytes.
pub fn encrypt_hashed_with(data: &[u8], key: &Key, random: &[u8; 255]) -> Option<Vec<u8>> {
    if data.len() > MAX_HASHED_PAYLOAD {
        return None;
    }
    let mut block = Vec::with_capacity(255);
    block.extend_from_slice(&sha1!(data));
    block.extend_from_slice(data);
    block.extend_from_slice(&random[..255 - block.len()]);
    Some(key.apply(&block))
}

// ─── Registry ───────────────────────────────────────────────────────────────

const PRODUCTION_N: &str = "29379598170669337022986177149456128565388431120058863768162556424047512191330847455146576344487764408661701890505066208632169112269581063774293102577308490531282748465986139880977280302242772832972539403531316010870401287642763009136156734339538042419388722777357134487746169093539093850251243897188928735903389451772730245253062963384108812842079887538976360465290946139638691491496062099570836476454855996319192747663615955633778034897140982517446405334423701359108810182097749467210509584293428076654573384828809574217079944388301239431309115013843331317877374435868468779972014486325557807783825502498215169806323";

const TEST_N: &str = "25342889448840415564971689590713473206898847759084779052582026594546022463853940585885215951168491965708222649399180603818074200620463776135424884632162512403163793083921641631564740959529419359595852941166848940585952337613333022396096584117954892216031229237302943701877588456738335398602461675225081791820393153757504952636234951323237820036543581047826906120927972487366805292115792231423684261262330394324750785450942589751755390156647751460719351439969059949569615302809050721500330239005077889855323917509948255722081644689442127297605422579707142646660768825302832201908302295573257427896031830742328565032949";

/// Known server keys, looked up by fingerprint.
#[derive(Clone, Debug, Default)]
pub struct PublicKeyRegistry {
    keys: HashMap<i64, Key>,
}

impl PublicKeyRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in production and test data-center keys.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for n in [PRODUCTION_N, TEST_N] {
            if let Some(key) = Key::new(n, "65537") {
                registry.insert(key);
            }
        }
        registry
    }

    /// Add `key`, returning its fingerprint.
    pub fn insert(&mut self, key: Key) -> i64 {
        let fp = key.fingerprint();
        self.keys.insert(fp, key);
        fp
    }

    pub fn get(&self, fingerprint: i64) -> Option<&Key> {
        self.keys.get(&fingerprint)
    }

    /// First fingerprint in `offered` that we have a key for.
    pub fn find(&self, offered: &[i64]) -> Option<(i64, &Key)> {
        offered.iter().find_map(|fp| self.keys.get(fp).map(|k| (*fp, k)))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_key_fingerprint() {
        let key = Key::new(PRODUCTION_N, "65537").unwrap();
        assert_eq!(key.fingerprint(), -3414540481677951611);
    }

    #[test]
    fn registry_picks_first_known_fingerprint() {
        let registry = PublicKeyRegistry::builtin();
        assert_eq!(registry.len(), 2);
        let (fp, _) = registry.find(&[1, -3414540481677951611]).unwrap();
        assert_eq!(fp, -3414540481677951611);
        assert!(registry.find(&[1, 2, 3]).is_none());
    }

    #[test]
    fn hashed_block_is_256_bytes() {
        let key = Key::new(PRODUCTION_N, "65537").unwrap();
        let out = encrypt_hashed_with(b"hello", &key, &[0u8; 255]).unwrap();
        assert_eq!(out.len(), 256);
        assert!(encrypt_hashed_with(&[0u8; 236], &key, &[0u8; 255]).is_none());
    }
}
