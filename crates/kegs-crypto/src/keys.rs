//! Symmetric keys: generation, base64 transport encoding, per-database derivation

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// A 256-bit symmetric key (file key, keg database key, or keg override key).
/// Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Decode a key shipped as base64 inside a file descriptor.
    pub fn from_b64(encoded: &str) -> anyhow::Result<Self> {
        let mut decoded = STANDARD
            .decode(encoded)
            .map_err(|e| anyhow::anyhow!("key is not valid base64: {e}"))?;
        if decoded.len() != KEY_SIZE {
            let len = decoded.len();
            decoded.zeroize();
            anyhow::bail!("key has wrong size: {len} bytes (expected {KEY_SIZE})");
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { bytes })
    }

    pub fn to_b64(&self) -> String {
        STANDARD.encode(self.bytes)
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit key.
pub fn generate_key() -> SymmetricKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    SymmetricKey::from_bytes(bytes)
}

/// Derive the key of one keg database from a master key via HKDF-SHA256.
pub fn derive_db_key(master: &SymmetricKey, db_id: &str) -> anyhow::Result<SymmetricKey> {
    let mut info = Vec::with_capacity(8 + db_id.len());
    info.extend_from_slice(b"kegs-db:");
    info.extend_from_slice(db_id.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(&info, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(SymmetricKey::from_bytes(okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let k1 = generate_key();
        let k2 = generate_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_b64_roundtrip() {
        let key = generate_key();
        let decoded = SymmetricKey::from_b64(&key.to_b64()).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn test_b64_wrong_length() {
        let short = STANDARD.encode([1u8; 16]);
        assert!(SymmetricKey::from_b64(&short).is_err());
        assert!(SymmetricKey::from_b64("not base64!!").is_err());
    }

    #[test]
    fn test_db_keys_differ_per_db() {
        let master = SymmetricKey::from_bytes([42u8; KEY_SIZE]);
        let a = derive_db_key(&master, "db-a").unwrap();
        let b = derive_db_key(&master, "db-b").unwrap();
        let a_again = derive_db_key(&master, "db-a").unwrap();

        assert_ne!(a, b, "different databases must produce different keys");
        assert_eq!(a, a_again, "derivation must be deterministic");
    }

    #[test]
    fn test_debug_redacts() {
        let key = SymmetricKey::from_bytes([7u8; KEY_SIZE]);
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
