//! AES-256 in Infinite Garble Extension (IGE) mode.
//!
//! IGE chains every block to both the previous ciphertext and the previous
//! plaintext block. The 32-byte IV holds those two seeds back to back.

use aes::Aes256;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};

const BLOCK: usize = 16;

fn xor_into(dst: &mut [u8; BLOCK], src: &[u8]) {
    for (a, b) in dst.iter_mut().zip(src) {
        *a ^= b;
    }
}

/// Encrypt `buffer` in place. `buffer.len()` must be a multiple of 16.
pub fn ige_encrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(buffer.len() % BLOCK, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher: [u8; BLOCK] = iv[..BLOCK].try_into().unwrap_or_default();
    let mut prev_plain: [u8; BLOCK] = iv[BLOCK..].try_into().unwrap_or_default();

    for chunk in buffer.chunks_exact_mut(BLOCK) {
        let plain: [u8; BLOCK] = (&*chunk).try_into().unwrap_or_default();

        let mut block = plain;
        xor_into(&mut block, &prev_cipher);
        let ga = GenericArray::from_mut_slice(&mut block);
        cipher.encrypt_block(ga);
        xor_into(&mut block, &prev_plain);

        chunk.copy_from_slice(&block);
        prev_cipher = block;
        prev_plain = plain;
    }
}

/// Decrypt `buffer` in place. `buffer.len()` must be a multiple of 16.
pub fn ige_decrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    debug_assert_eq!(buffer.len() % BLOCK, 0);
    let cipher = Aes256::new(GenericArray::from_slice(key));

    let mut prev_cipher: [u8; BLOCK] = iv[..BLOCK].try_into().unwrap_or_default();
    let mut prev_plain: [u8; BLOCK] = iv[BLOCK..].try_into().unwrap_or_default();

    for chunk in buffer.chunks_exact_mut(BLOCK) {
        let encrypted: [u8; BLOCK] = (&*chunk).try_into().unwrap_or_default();

        let mut block = encrypted;
        xor_into(&mut block, &prev_plain);
        let ga = GenericArray::from_mut_slice(&mut block);
        cipher.decrypt_block(ga);
        xor_into(&mut block, &prev_cipher);

        chunk.copy_from_slice(&block);
        prev_cipher = encrypted;
        prev_plain = block;
    }
}
