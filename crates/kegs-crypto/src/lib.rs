//! kegs-crypto: client-side encryption for kegs and chunked file transfers
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit)
//!   ├── Keg Database Key (HKDF from master key, info="kegs-db:<db_id>")
//!   │   └── Keg payload: XChaCha20-Poly1305, random 192-bit nonce prepended
//!   └── File Key (per-file, 256-bit random, shipped inside the file keg)
//!       └── Chunk AEAD: XChaCha20-Poly1305, nonce = prefix || chunk_index
//! ```

pub mod chunk;
pub mod keys;
pub mod nonce;
pub mod secret;

pub use chunk::{decrypt_chunk, encrypt_chunk};
pub use keys::{derive_db_key, generate_key, SymmetricKey};
pub use nonce::{Nonce, NonceGenerator};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Bytes added to every encrypted file chunk
pub const CHUNK_OVERHEAD: usize = TAG_SIZE;
