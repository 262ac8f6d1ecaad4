//! Cryptographic primitives for the MTProto session engine.
//!
//! Provides:
//! - AES-256-IGE encryption/decryption
//! - SHA-1 / SHA-256 hash macros
//! - Pollard-rho pq factorization
//! - RSA public keys, fingerprints and the hashed-block scheme
//! - Miller-Rabin primality testing
//! - `AuthKey`, the 256-byte session key
//! - MTProto 2.0 message encryption / decryption
//! - DH nonce→key derivation

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
mod factorize;
mod prime;
pub mod rsa;
mod sha;

pub use auth_key::AuthKey;
pub use factorize::factorize;
pub use prime::is_probable_prime;

/// Fill `buf` from the operating system's CSPRNG.
///
/// # Panics
/// If the OS entropy source is unavailable, which leaves no safe way to
/// continue producing keys or nonces.
pub fn fill_random(buf: &mut [u8]) {
    getrandom::getrandom(buf).expect("getrandom failed");
}

// ─── MTProto 2.0 encrypt / decrypt ───────────────────────────────────────────

/// Errors from [`decrypt_data_v2`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    InvalidBuffer,
    /// The `auth_key_id` in the ciphertext does not match our key.
    AuthKeyMismatch,
    /// The `msg_key` in the ciphertext does not match our computed value.
    MessageKeyMismatch,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBuffer => write!(f, "invalid ciphertext buffer length"),
            Self::AuthKeyMismatch => write!(f, "auth_key_id mismatch"),
            Self::MessageKeyMismatch => write!(f, "msg_key mismatch"),
        }
    }
}
impl std::error::Error for DecryptError {}

/// The party that produced a message. Selects the `x` offset into the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn x(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 8,
        }
    }
}

fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let sha_b = sha256!(&auth_key.data[40 + x..40 + x + 36], msg_key);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

/// Random padding appended to a plaintext of `len` bytes: at least 12 bytes,
/// and enough to make the total a multiple of 16.
pub fn padding_len(len: usize) -> usize {
    let unpadded = (len + 12) % 16;
    12 + if unpadded == 0 { 0 } else { 16 - unpadded }
}

/// Output of [`encrypt_data_v2`].
#[derive(Clone, Debug)]
pub struct EncryptedData {
    /// `auth_key_id || msg_key || ciphertext`
    pub frame: Vec<u8>,
    /// Token the server echoes back as a quick acknowledgment.
    pub quick_ack: i32,
}

/// Pad `plaintext` with random bytes and encrypt it under `auth_key`.
pub fn encrypt_data_v2(plaintext: &[u8], auth_key: &AuthKey, side: Side) -> EncryptedData {
    let mut padding = [0u8; 27];
    fill_random(&mut padding);
    do_encrypt_data_v2(plaintext, auth_key, side, &padding)
}

pub(crate) fn do_encrypt_data_v2(
    plaintext: &[u8],
    auth_key: &AuthKey,
    side: Side,
    padding: &[u8; 27],
) -> EncryptedData {
    let pad = padding_len(plaintext.len());
    let mut frame = Vec::with_capacity(24 + plaintext.len() + pad);
    frame.extend_from_slice(&auth_key.key_id);
    frame.extend_from_slice(&[0u8; 16]);
    frame.extend_from_slice(plaintext);
    frame.extend_from_slice(&padding[..pad]);

    let x = side.x();
    let msg_key_large = sha256!(&auth_key.data[88 + x..88 + x + 32], &frame[24..]);
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&msg_key_large[8..24]);
    frame[8..24].copy_from_slice(&msg_key);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    aes::ige_encrypt(&mut frame[24..], &key, &iv);

    let mut token = [0u8; 4];
    token.copy_from_slice(&msg_key_large[..4]);
    EncryptedData { frame, quick_ack: i32::from_le_bytes(token) | i32::MIN }
}

/// Decrypt an MTProto 2.0 frame written by `sender`.
///
/// `buffer` must start with `key_id || msg_key || ciphertext`.
/// On success returns a slice of `buffer` containing the padded plaintext.
pub fn decrypt_data_v2<'a>(
    buffer: &'a mut [u8],
    auth_key: &AuthKey,
    sender: Side,
) -> Result<&'a mut [u8], DecryptError> {
    if buffer.len() < 24 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, sender);
    aes::ige_decrypt(&mut buffer[24..], &key, &iv);

    let x = sender.x();
    let our_key = sha256!(&auth_key.data[88 + x..88 + x + 32], &buffer[24..]);
    if msg_key != our_key[8..24] {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut buffer[24..])
}

/// Derive `(key, iv)` from nonces for decrypting `ServerDhParams.encrypted_answer`.
pub fn generate_key_data_from_nonce(server_nonce: &[u8; 16], new_nonce: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let h1 = sha1!(new_nonce, server_nonce);
    let h2 = sha1!(server_nonce, new_nonce);
    let h3 = sha1!(new_nonce, new_nonce);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&h1);
    key[20..].copy_from_slice(&h2[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&h2[12..]);
    iv[8..28].copy_from_slice(&h3);
    iv[28..].copy_from_slice(&new_nonce[..4]);

    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AuthKey {
        AuthKey::from_bytes(core::array::from_fn(|i| (i * 7) as u8))
    }

    #[test]
    fn padding_is_aligned_and_bounded() {
        for len in 0..200 {
            let pad = padding_len(len);
            assert!((12..=27).contains(&pad), "len {len} pad {pad}");
            assert_eq!((len + pad) % 16, 0);
        }
    }

    #[test]
    fn client_frame_decrypts_as_client() {
        let plain = b"0123456789abcdef0123456789abcdef".to_vec();
        let out = do_encrypt_data_v2(&plain, &key(), Side::Client, &[9u8; 27]);
        assert_eq!(&out.frame[..8], &key().key_id());
        assert!(out.quick_ack < 0);

        let mut frame = out.frame;
        let decrypted = decrypt_data_v2(&mut frame, &key(), Side::Client).unwrap();
        assert_eq!(&decrypted[..plain.len()], &plain[..]);
    }

    #[test]
    fn wrong_side_is_rejected() {
        let mut frame = encrypt_data_v2(b"some body", &key(), Side::Server).frame;
        assert_eq!(
            decrypt_data_v2(&mut frame, &key(), Side::Client).unwrap_err(),
            DecryptError::MessageKeyMismatch
        );
    }

    #[test]
    fn corruption_is_detected() {
        let mut frame = encrypt_data_v2(&[1u8; 40], &key(), Side::Server).frame;
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert_eq!(
            decrypt_data_v2(&mut frame, &key(), Side::Server).unwrap_err(),
            DecryptError::MessageKeyMismatch
        );

        let mut other = encrypt_data_v2(&[1u8; 40], &key(), Side::Server).frame;
        other[0] ^= 0xff;
        assert_eq!(
            decrypt_data_v2(&mut other, &key(), Side::Server).unwrap_err(),
            DecryptError::AuthKeyMismatch
        );
    }
}
