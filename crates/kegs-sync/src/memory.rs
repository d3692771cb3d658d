//! In-memory remote store and blob transport.
//!
//! Enforces the same version and range rules as a real store, so kegs and
//! transfer pipelines can be exercised without a server.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use kegs_core::{KegError, KegResult};

use crate::remote::{ChunkTransport, CreatedRecord, RawRecord, RecordUpdate, RemoteStore, UpdateAck};

#[derive(Default)]
struct StoreInner {
    records: HashMap<(String, String), RawRecord>,
    /// Collection version per (db, keg type)
    collections: HashMap<(String, String), u64>,
    blobs: HashMap<String, Vec<u8>>,
    next_id: u64,
}

impl StoreInner {
    fn bump_collection(&mut self, db_id: &str, kind: &str) -> u64 {
        let counter = self
            .collections
            .entry((db_id.to_string(), kind.to_string()))
            .or_insert(0);
        *counter += 1;
        *counter
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a blob's stored bytes.
    pub fn put_blob(&self, file_id: &str, bytes: Vec<u8>) {
        self.inner.lock().unwrap().blobs.insert(file_id.to_string(), bytes);
    }

    pub fn blob(&self, file_id: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().blobs.get(file_id).cloned()
    }

    /// Overwrite a stored record wholesale, bypassing version checks.
    pub fn replace_record(&self, db_id: &str, record: RawRecord) {
        self.inner
            .lock()
            .unwrap()
            .records
            .insert((db_id.to_string(), record.id.clone()), record);
    }

    pub fn record_count(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }
}

fn not_found(what: &str) -> KegError {
    KegError::from_status(404, format!("{what} not found"))
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn create_record(&self, db_id: &str, kind: &str) -> KegResult<CreatedRecord> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = format!("keg{:08}", inner.next_id);
        let collection_version = inner.bump_collection(db_id, kind);

        let record = RawRecord {
            id: id.clone(),
            kind: kind.to_string(),
            version: 1,
            collection_version,
            props: Default::default(),
            payload: None,
        };
        inner.records.insert((db_id.to_string(), id.clone()), record);
        debug!(db_id, kind, id = %id, "created record");

        Ok(CreatedRecord {
            id,
            version: 1,
            collection_version,
        })
    }

    async fn update_record(&self, db_id: &str, update: RecordUpdate) -> KegResult<UpdateAck> {
        let mut inner = self.inner.lock().unwrap();
        let key = (db_id.to_string(), update.id.clone());
        let stored_version = match inner.records.get(&key) {
            Some(record) => record.version,
            None => return Err(not_found(&format!("record {}", update.id))),
        };

        if update.version != stored_version + 1 {
            return Err(KegError::VersionConflict {
                id: update.id,
                sent: update.version,
            });
        }

        let collection_version = inner.bump_collection(db_id, &update.kind);
        let record = RawRecord {
            id: update.id,
            kind: update.kind,
            version: update.version,
            collection_version,
            props: update.props,
            payload: Some(update.payload),
        };
        inner.records.insert(key, record);

        Ok(UpdateAck { collection_version })
    }

    async fn get_record(&self, db_id: &str, id: &str) -> KegResult<RawRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(&(db_id.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| not_found(&format!("record {id}")))
    }
}

#[async_trait]
impl ChunkTransport for MemoryStore {
    async fn fetch_chunk_range(&self, file_id: &str, start: u64, end: u64) -> KegResult<Bytes> {
        let inner = self.inner.lock().unwrap();
        let blob = inner
            .blobs
            .get(file_id)
            .ok_or_else(|| not_found(&format!("blob {file_id}")))?;

        let len = blob.len() as u64;
        if start >= len || end < start {
            return Ok(Bytes::new());
        }
        let stop = end.saturating_add(1).min(len);
        Ok(Bytes::copy_from_slice(&blob[start as usize..stop as usize]))
    }

    async fn upload_chunk(&self, file_id: &str, offset: u64, ciphertext: Bytes) -> KegResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let blob = inner.blobs.entry(file_id.to_string()).or_default();

        let start = offset as usize;
        let stop = start + ciphertext.len();
        if blob.len() < stop {
            blob.resize(stop, 0);
        }
        blob[start..stop].copy_from_slice(&ciphertext);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_update_requires_next_version() {
        let store = MemoryStore::new();
        let created = store.create_record("db", "note").await.unwrap();
        assert_eq!(created.version, 1);

        let update = RecordUpdate {
            id: created.id.clone(),
            kind: "note".into(),
            key_id: "0".into(),
            payload: b"{}".to_vec(),
            props: Default::default(),
            version: 2,
        };
        store.update_record("db", update.clone()).await.unwrap();

        let err = store.update_record("db", update).await.unwrap_err();
        assert!(matches!(err, KegError::VersionConflict { sent: 2, .. }));

        let record = store.get_record("db", &created.id).await.unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.payload.as_deref(), Some(&b"{}"[..]));
    }

    #[tokio::test]
    async fn collection_version_is_per_type() {
        let store = MemoryStore::new();
        let a = store.create_record("db", "note").await.unwrap();
        let b = store.create_record("db", "note").await.unwrap();
        let c = store.create_record("db", "file").await.unwrap();
        assert_eq!(a.collection_version, 1);
        assert_eq!(b.collection_version, 2);
        assert_eq!(c.collection_version, 1);
        assert_ne!(a.id, b.id);
        assert_eq!(store.record_count(), 3);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get_record("db", "nope").await.unwrap_err();
        assert!(matches!(err, KegError::Server { code: 404, .. }));
    }

    #[tokio::test]
    async fn blob_range_is_inclusive_and_clamped() {
        let store = MemoryStore::new();
        store.put_blob("f", (0u8..10).collect());

        let bytes = store.fetch_chunk_range("f", 2, 4).await.unwrap();
        assert_eq!(&bytes[..], &[2, 3, 4]);

        let tail = store.fetch_chunk_range("f", 8, 100).await.unwrap();
        assert_eq!(&tail[..], &[8, 9]);

        let past = store.fetch_chunk_range("f", 10, 20).await.unwrap();
        assert!(past.is_empty());
    }

    #[tokio::test]
    async fn upload_overwrites_at_offset() {
        let store = MemoryStore::new();
        store
            .upload_chunk("f", 4, Bytes::from_static(b"xy"))
            .await
            .unwrap();
        store
            .upload_chunk("f", 4, Bytes::from_static(b"ab"))
            .await
            .unwrap();
        assert_eq!(store.blob("f").unwrap(), vec![0, 0, 0, 0, b'a', b'b']);
    }
}
