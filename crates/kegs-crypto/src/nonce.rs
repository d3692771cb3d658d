//! Per-chunk nonce generation
//!
//! Nonce layout (24 bytes):
//! ```text
//! [16 bytes: file-scoped prefix][8 bytes: chunk index, big-endian]
//! ```
//!
//! The chunk index is the only varying part, so for one file key the nonce of
//! chunk `i` is fixed for all time: an upload and a later download (or a
//! resumed transfer in a new process) agree on it without storing anything.

use crate::NONCE_SIZE;

pub type Nonce = [u8; NONCE_SIZE];

const PREFIX_SIZE: usize = NONCE_SIZE - 8;

/// Sequential nonce source for one file transfer.
#[derive(Debug, Clone)]
pub struct NonceGenerator {
    prefix: [u8; PREFIX_SIZE],
    next_chunk: u64,
}

impl NonceGenerator {
    /// Start at chunk `start_chunk` (0 for a fresh transfer, `whole_chunks_completed` on resume).
    pub fn new(start_chunk: u64) -> Self {
        Self {
            prefix: [0u8; PREFIX_SIZE],
            next_chunk: start_chunk,
        }
    }

    pub fn with_prefix(mut self, prefix: [u8; PREFIX_SIZE]) -> Self {
        self.prefix = prefix;
        self
    }

    /// Index of the chunk the next call to `next()` is for.
    pub fn chunk_id(&self) -> u64 {
        self.next_chunk
    }

    /// Consume and return the nonce for the next chunk.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Nonce {
        let nonce = self.nonce_for(self.next_chunk);
        self.next_chunk += 1;
        nonce
    }

    /// Nonce for an arbitrary chunk index, without advancing.
    pub fn nonce_for(&self, chunk_index: u64) -> Nonce {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..PREFIX_SIZE].copy_from_slice(&self.prefix);
        nonce[PREFIX_SIZE..].copy_from_slice(&chunk_index.to_be_bytes());
        nonce
    }
}
