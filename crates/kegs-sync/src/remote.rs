//! Remote store and blob transport interfaces consumed by kegs and transfers.
//!
//! Implementations own the wire encoding and the authenticated connection;
//! everything here sees only the abstract record and byte-range operations.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use kegs_core::types::PropValue;
use kegs_core::KegResult;

/// Identity and counters the store assigns to a newly created record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedRecord {
    pub id: String,
    pub version: u64,
    pub collection_version: u64,
}

/// A full record update. `version` must be the stored version plus one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordUpdate {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Reserved for key rotation; always "0" today
    pub key_id: String,
    pub payload: Vec<u8>,
    pub props: BTreeMap<String, PropValue>,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAck {
    pub collection_version: u64,
}

/// A record as stored remotely. `payload` is `None` for a just-created record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u64,
    pub collection_version: u64,
    #[serde(default)]
    pub props: BTreeMap<String, PropValue>,
    pub payload: Option<Vec<u8>>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create_record(&self, db_id: &str, kind: &str) -> KegResult<CreatedRecord>;

    /// Fails with `KegError::VersionConflict` when `update.version` is stale.
    async fn update_record(&self, db_id: &str, update: RecordUpdate) -> KegResult<UpdateAck>;

    async fn get_record(&self, db_id: &str, id: &str) -> KegResult<RawRecord>;
}

#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Fetch stored bytes `start..=end` of a blob.
    ///
    /// A locked range fails with `KegError::Locked`; the caller must ask
    /// again from scratch rather than retrying the same request.
    async fn fetch_chunk_range(&self, file_id: &str, start: u64, end: u64) -> KegResult<Bytes>;

    /// Store `ciphertext` at `offset` of a blob, overwriting what is there.
    async fn upload_chunk(&self, file_id: &str, offset: u64, ciphertext: Bytes) -> KegResult<()>;
}
