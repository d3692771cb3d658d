//! Keg payload sealing with a random nonce
//!
//! Sealed format: `[24-byte random nonce][ciphertext][16-byte tag]`.
//! Unlike file chunks, keg payloads are re-encrypted on every save, so a
//! fresh random nonce travels with the ciphertext.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::keys::SymmetricKey;
use crate::{NONCE_SIZE, TAG_SIZE};

pub fn seal(plaintext: &[u8], key: &SymmetricKey) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("payload encryption failed: {e}"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

pub fn open(sealed: &[u8], key: &SymmetricKey) -> anyhow::Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        anyhow::bail!(
            "sealed payload too short: {} bytes (minimum {})",
            sealed.len(),
            NONCE_SIZE + TAG_SIZE
        );
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(XNonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| anyhow::anyhow!("payload decryption failed: invalid key or corrupted data"))
}

/// Seal a UTF-8 string (serialized keg payload).
pub fn seal_str(plaintext: &str, key: &SymmetricKey) -> anyhow::Result<Vec<u8>> {
    seal(plaintext.as_bytes(), key)
}

pub fn open_str(sealed: &[u8], key: &SymmetricKey) -> anyhow::Result<String> {
    let bytes = open(sealed, key)?;
    String::from_utf8(bytes).map_err(|e| anyhow::anyhow!("payload is not UTF-8: {e}"))
}
