//! Per-chunk XChaCha20-Poly1305 encryption/decryption
//!
//! Encrypted chunk format (binary):
//! ```text
//! [N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! The nonce is not stored with the chunk: it comes from the transfer's
//! `NonceGenerator`, so every chunk costs exactly `CHUNK_OVERHEAD` bytes.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};

use crate::keys::SymmetricKey;
use crate::nonce::Nonce;
use crate::CHUNK_OVERHEAD;

/// Encrypt one chunk. Output length is `plaintext.len() + CHUNK_OVERHEAD`.
pub fn encrypt_chunk(plaintext: &[u8], key: &SymmetricKey, nonce: &Nonce) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|e| anyhow::anyhow!("chunk encryption failed: {e}"))
}

/// Decrypt one chunk produced by `encrypt_chunk` with the same key and nonce.
pub fn decrypt_chunk(ciphertext: &[u8], key: &SymmetricKey, nonce: &Nonce) -> anyhow::Result<Vec<u8>> {
    if ciphertext.len() < CHUNK_OVERHEAD {
        anyhow::bail!(
            "encrypted chunk too short: {} bytes (minimum {})",
            ciphertext.len(),
            CHUNK_OVERHEAD
        );
    }

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow::anyhow!("chunk decryption failed: invalid key, corrupted data, or wrong nonce"))
}
