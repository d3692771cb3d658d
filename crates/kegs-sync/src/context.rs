//! Shared services for keg and transfer operations.
//!
//! One `SyncContext` is built per session and passed around by `Arc`; it
//! carries configuration, the remote store, the blob transport, the resume
//! store, the keyed retry registry and the session shutdown token.

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kegs_core::config::KegsConfig;
use kegs_core::types::FileSubject;
use kegs_core::KegResult;
use kegs_crypto::SymmetricKey;

use crate::memory::MemoryStore;
use crate::remote::{ChunkTransport, RemoteStore};
use crate::resume::{JsonFileStore, KeyValueStore, MemoryKvStore, ResumeStore};
use crate::retry::{KeyedRetry, RetryPolicy};
use crate::stream::{ChunkSink, ChunkSource};
use crate::transfer::{Downloader, Uploader};

pub struct SyncContext {
    config: KegsConfig,
    store: Arc<dyn RemoteStore>,
    transport: Arc<dyn ChunkTransport>,
    resume: ResumeStore,
    retries: KeyedRetry<()>,
    shutdown: CancellationToken,
}

impl SyncContext {
    pub fn new(
        config: KegsConfig,
        store: Arc<dyn RemoteStore>,
        transport: Arc<dyn ChunkTransport>,
        kv: Arc<dyn KeyValueStore>,
    ) -> KegResult<Arc<Self>> {
        config.validate()?;
        let policy = match config.retry.attempt_limit() {
            Some(max) => RetryPolicy::bounded(max, config.retry.delay()),
            None => RetryPolicy::unbounded(config.retry.delay()),
        };

        Ok(Arc::new(Self {
            store,
            transport,
            resume: ResumeStore::new(kv),
            retries: KeyedRetry::new(policy),
            shutdown: CancellationToken::new(),
            config,
        }))
    }

    /// Context whose resume descriptors live in `storage.resume_db`.
    pub fn open(
        config: KegsConfig,
        store: Arc<dyn RemoteStore>,
        transport: Arc<dyn ChunkTransport>,
    ) -> KegResult<Arc<Self>> {
        let path = config.storage.resume_db_path();
        info!(path = %path.display(), "opening resume store");
        let kv = Arc::new(JsonFileStore::open(&path));
        Self::new(config, store, transport, kv)
    }

    /// Fully in-memory context; the returned store backs both records and blobs.
    pub fn in_memory(config: KegsConfig) -> KegResult<(Arc<Self>, Arc<MemoryStore>)> {
        let memory = Arc::new(MemoryStore::new());
        let ctx = Self::new(
            config,
            Arc::clone(&memory) as Arc<dyn RemoteStore>,
            Arc::clone(&memory) as Arc<dyn ChunkTransport>,
            Arc::new(MemoryKvStore::new()),
        )?;
        Ok((ctx, memory))
    }

    pub fn config(&self) -> &KegsConfig {
        &self.config
    }

    pub fn store(&self) -> &dyn RemoteStore {
        self.store.as_ref()
    }

    pub fn transport(&self) -> Arc<dyn ChunkTransport> {
        Arc::clone(&self.transport)
    }

    pub fn resume(&self) -> &ResumeStore {
        &self.resume
    }

    pub fn retries(&self) -> &KeyedRetry<()> {
        &self.retries
    }

    /// Cancel every transfer started from this context. Their resume
    /// descriptors stay in the store for the next session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Describe a plaintext file of `plain_size` bytes with configured chunking.
    pub fn file_subject(&self, file_id: &str, plain_size: u64) -> FileSubject {
        FileSubject::for_plaintext(
            file_id,
            plain_size,
            self.config.files.chunk_size,
            self.config.files.chunk_overhead,
        )
    }

    pub fn downloader(
        &self,
        subject: FileSubject,
        key: SymmetricKey,
        local_path: &Path,
        sink: Box<dyn ChunkSink>,
    ) -> KegResult<Downloader> {
        let downloader = Downloader::new(
            self.transport(),
            subject,
            key,
            local_path,
            sink,
            self.config.download.clone(),
        )?;
        Ok(downloader
            .with_resume_store(self.resume.clone())
            .within_session(self.shutdown.clone()))
    }

    pub fn uploader(
        &self,
        subject: FileSubject,
        key: SymmetricKey,
        local_path: &Path,
        source: Box<dyn ChunkSource>,
    ) -> KegResult<Uploader> {
        let uploader = Uploader::new(
            self.transport(),
            subject,
            key,
            local_path,
            source,
            self.config.upload.clone(),
        )?;
        Ok(uploader
            .with_resume_store(self.resume.clone())
            .within_session(self.shutdown.clone()))
    }
}
