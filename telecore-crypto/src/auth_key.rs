//! `AuthKey`: the 256-byte shared secret produced by the DH handshake.

use crate::sha1;

/// An authorization key plus its derived identifiers.
///
/// Temporary keys (negotiated with `expires_in`) carry the unix time at which
/// the server forgets them.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    pub(crate) aux_hash: [u8; 8],
    pub(crate) key_id: [u8; 8],
    expires_at: Option<i64>,
}

impl AuthKey {
    /// Construct from raw 256-byte DH output.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let sha = sha1!(&data);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&sha[..8]);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, aux_hash, key_id, expires_at: None }
    }

    /// Mark this key as temporary.
    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn to_bytes(&self) -> [u8; 256] { self.data }

    /// `SHA1(key)[12..20]` as it appears on the wire.
    pub fn key_id(&self) -> [u8; 8] { self.key_id }

    /// The key id read as a little-endian integer.
    pub fn id(&self) -> i64 { i64::from_le_bytes(self.key_id) }

    pub fn expires_at(&self) -> Option<i64> { self.expires_at }

    /// `SHA1(new_nonce || number || aux_hash)[4..20]`, used to verify
    /// `dh_gen_ok` (1), `dh_gen_retry` (2) and `dh_gen_fail` (3).
    pub fn calc_new_nonce_hash(&self, new_nonce: &[u8; 32], number: u8) -> [u8; 16] {
        let sha = sha1!(new_nonce, [number], &self.aux_hash);
        let mut out = [0u8; 16];
        out.copy_from_slice(&sha[4..]);
        out
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(id={:016x})", self.id() as u64)
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool { self.key_id == other.key_id && self.data == other.data }
}

impl Eq for AuthKey {}
