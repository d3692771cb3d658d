use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{KegError, KegResult};

/// Unencrypted scalar stored in a keg's `props` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        PropValue::Str(s.to_string())
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

/// Direction of a chunked file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    /// Prefix used for resume-store keys.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            TransferDirection::Upload => "UPLOAD:",
            TransferDirection::Download => "DOWNLOAD:",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        }
    }
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote blob description shared by the uploader and downloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSubject {
    pub file_id: String,
    /// Plaintext bytes per chunk (the last chunk may be shorter)
    pub chunk_size: u64,
    /// Ciphertext bytes added to every chunk
    pub chunk_overhead: u64,
    /// Total stored size: plaintext size plus one overhead per chunk
    pub size_with_overhead: u64,
}

impl FileSubject {
    /// Describe a file of `plain_size` bytes split into `chunk_size` chunks.
    pub fn for_plaintext(
        file_id: impl Into<String>,
        plain_size: u64,
        chunk_size: u64,
        chunk_overhead: u64,
    ) -> Self {
        let chunks = chunk_count(plain_size, chunk_size);
        Self {
            file_id: file_id.into(),
            chunk_size,
            chunk_overhead,
            size_with_overhead: plain_size + chunks * chunk_overhead,
        }
    }

    pub fn chunk_size_with_overhead(&self) -> u64 {
        self.chunk_size + self.chunk_overhead
    }

    /// Number of chunks the stored blob is made of.
    pub fn chunk_count(&self) -> u64 {
        chunk_count(self.size_with_overhead, self.chunk_size_with_overhead())
    }

    /// Plaintext size recovered from the stored size.
    ///
    /// Fails when the last stored chunk is too short to carry its overhead,
    /// which only happens for malformed metadata.
    pub fn plain_size(&self) -> KegResult<u64> {
        let chunks = self.chunk_count();
        if chunks == 0 {
            return Ok(self.size_with_overhead);
        }
        let last = self.size_with_overhead - (chunks - 1) * self.chunk_size_with_overhead();
        if last < self.chunk_overhead {
            return Err(KegError::Config(format!(
                "file {}: stored size {} leaves a {last}-byte final chunk, shorter than its {}-byte overhead",
                self.file_id, self.size_with_overhead, self.chunk_overhead
            )));
        }
        Ok(self.size_with_overhead - chunks * self.chunk_overhead)
    }
}

fn chunk_count(size: u64, chunk: u64) -> u64 {
    if chunk == 0 {
        return 0;
    }
    size.div_ceil(chunk)
}

/// Persisted state that lets an interrupted transfer continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeDescriptor {
    pub file_id: String,
    pub local_path: PathBuf,
    pub direction: TransferDirection,
    pub whole_chunks_completed: u64,
    pub partial_chunk_size: u64,
}

impl ResumeDescriptor {
    pub fn new(file_id: impl Into<String>, local_path: PathBuf, direction: TransferDirection) -> Self {
        Self {
            file_id: file_id.into(),
            local_path,
            direction,
            whole_chunks_completed: 0,
            partial_chunk_size: 0,
        }
    }

    /// Resume-store key, e.g. `DOWNLOAD:<file_id>`.
    pub fn key(&self) -> String {
        resume_key(self.direction, &self.file_id)
    }

    /// Derive the restart position from the plaintext already on disk.
    pub fn with_local_len(mut self, local_len: u64, chunk_size: u64) -> Self {
        if chunk_size > 0 {
            self.whole_chunks_completed = local_len / chunk_size;
            self.partial_chunk_size = local_len % chunk_size;
        }
        self
    }

    pub fn is_fresh(&self) -> bool {
        self.whole_chunks_completed == 0 && self.partial_chunk_size == 0
    }
}

pub fn resume_key(direction: TransferDirection, file_id: &str) -> String {
    format!("{}{}", direction.key_prefix(), file_id)
}

/// Parse a resume-store key back into its direction and file id.
pub fn parse_resume_key(key: &str) -> Option<(TransferDirection, &str)> {
    for direction in [TransferDirection::Download, TransferDirection::Upload] {
        if let Some(id) = key.strip_prefix(direction.key_prefix()) {
            if !id.is_empty() {
                return Some((direction, id));
            }
        }
    }
    None
}

/// Lifecycle of a transfer processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Idle,
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Succeeded | TransferState::Failed(_) | TransferState::Cancelled
        )
    }
}
