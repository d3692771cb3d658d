//! Chunked, resumable, encrypting uploader.
//!
//! Chunk `k` of the plaintext is encrypted with the nonce for index `k` and
//! stored at offset `k * (chunk_size + chunk_overhead)`. Uploads run with
//! bounded parallelism but are confirmed strictly in order; after each
//! confirmation the resume descriptor records how many whole chunks are
//! safely stored, so a later run restarts at the first unconfirmed chunk.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesOrdered, StreamExt};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kegs_core::config::UploadConfig;
use kegs_core::types::{FileSubject, ResumeDescriptor, TransferDirection};
use kegs_core::{KegError, KegResult};
use kegs_crypto::{encrypt_chunk, NonceGenerator, SymmetricKey, CHUNK_OVERHEAD};

use super::{discards_descriptor, Pipeline, ProgressFn, Step, TransferHandle, TransferProgress};
use crate::remote::ChunkTransport;
use crate::resume::ResumeStore;
use crate::retry::{retry_if, RetryPolicy};
use crate::stream::ChunkSource;

/// Resolves to `(chunk_index, stored_len)` once the chunk is stored.
type UploadFuture = BoxFuture<'static, KegResult<(u64, u64)>>;

pub struct Uploader {
    subject: FileSubject,
    key: SymmetricKey,
    local_path: PathBuf,
    transport: Arc<dyn ChunkTransport>,
    settings: UploadConfig,
    resume: Option<ResumeStore>,
    on_progress: Option<ProgressFn>,
    progress: Arc<TransferProgress>,
    cancel: CancellationToken,
    session: Option<CancellationToken>,

    source: Option<Box<dyn ChunkSource>>,
    encrypt_queue: VecDeque<(u64, Bytes)>,
    uploads: FuturesOrdered<UploadFuture>,
    nonces: NonceGenerator,

    plain_size: u64,
    total_chunks: u64,
    next_chunk: u64,
    confirmed_chunks: u64,
}

impl Uploader {
    pub fn new(
        transport: Arc<dyn ChunkTransport>,
        subject: FileSubject,
        key: SymmetricKey,
        local_path: &Path,
        source: Box<dyn ChunkSource>,
        settings: UploadConfig,
    ) -> KegResult<Self> {
        if subject.chunk_overhead != CHUNK_OVERHEAD as u64 {
            return Err(KegError::Config(format!(
                "chunk overhead {} does not match cipher overhead {CHUNK_OVERHEAD}",
                subject.chunk_overhead
            )));
        }
        if subject.chunk_size == 0 {
            return Err(KegError::Config("chunk_size must be > 0".into()));
        }
        let plain_size = subject.plain_size()?;
        if plain_size != source.size() {
            return Err(KegError::Config(format!(
                "file {} describes {plain_size} bytes but the source holds {}",
                subject.file_id,
                source.size()
            )));
        }

        let total_chunks = subject.chunk_count();
        let progress = Arc::new(TransferProgress::new(subject.size_with_overhead, 0));
        Ok(Self {
            subject,
            key,
            local_path: local_path.to_path_buf(),
            transport,
            settings,
            resume: None,
            on_progress: None,
            progress,
            cancel: CancellationToken::new(),
            session: None,
            source: Some(source),
            encrypt_queue: VecDeque::new(),
            uploads: FuturesOrdered::new(),
            nonces: NonceGenerator::new(0),
            plain_size,
            total_chunks,
            next_chunk: 0,
            confirmed_chunks: 0,
        })
    }

    /// Skip the chunks a previous run already stored.
    pub fn resume_from(mut self, descriptor: &ResumeDescriptor) -> Self {
        let whole = descriptor.whole_chunks_completed.min(self.total_chunks);
        self.nonces = NonceGenerator::new(whole);
        self.next_chunk = whole;
        self.confirmed_chunks = whole;
        let done = whole
            .saturating_mul(self.subject.chunk_size_with_overhead())
            .min(self.subject.size_with_overhead);
        self.progress = Arc::new(TransferProgress::new(self.subject.size_with_overhead, done));
        self
    }

    pub fn with_resume_store(mut self, store: ResumeStore) -> Self {
        self.resume = Some(store);
        self
    }

    pub fn on_progress(mut self, callback: ProgressFn) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run inside `session`: shutting the session down cancels this transfer
    /// but keeps its resume descriptor for the next session.
    pub fn within_session(mut self, session: CancellationToken) -> Self {
        self.cancel = session.child_token();
        self.session = Some(session);
        self
    }

    pub fn progress(&self) -> Arc<TransferProgress> {
        Arc::clone(&self.progress)
    }

    pub fn start(self) -> TransferHandle {
        let progress = Arc::clone(&self.progress);
        let cancel = self.cancel.clone();
        super::start(Box::new(self), progress, cancel)
    }

    fn descriptor(&self) -> ResumeDescriptor {
        ResumeDescriptor {
            file_id: self.subject.file_id.clone(),
            local_path: self.local_path.clone(),
            direction: TransferDirection::Upload,
            whole_chunks_completed: self.confirmed_chunks,
            partial_chunk_size: 0,
        }
    }

    fn encrypt_queue_full(&self) -> bool {
        let queued = self.encrypt_queue.len() as u64 * (self.subject.chunk_size_with_overhead() + 1);
        queued > self.settings.max_encrypt_buffer_size * self.settings.parallelism as u64
    }

    async fn read_and_encrypt(&mut self) -> KegResult<()> {
        let index = self.next_chunk;
        let offset = index * self.subject.chunk_size;
        let len = self
            .subject
            .chunk_size
            .min(self.plain_size - offset) as usize;

        let source = self
            .source
            .as_mut()
            .ok_or_else(|| KegError::Storage("upload source already released".into()))?;
        let plaintext = source.read_at(offset, len).await?;
        if plaintext.len() != len {
            return Err(KegError::Storage(format!(
                "source returned {} bytes for chunk {index}, expected {len}",
                plaintext.len()
            )));
        }

        // the nonce is consumed before any network attempt for this chunk
        let nonce = self.nonces.next();
        let ciphertext = encrypt_chunk(&plaintext, &self.key, &nonce)
            .map_err(|e| KegError::Crypto(format!("chunk {index}: {e:#}")))?;

        self.encrypt_queue.push_back((index, Bytes::from(ciphertext)));
        self.next_chunk += 1;

        let queued: u64 = self.encrypt_queue.iter().map(|(_, c)| c.len() as u64).sum();
        self.progress.note_buffered(queued);
        Ok(())
    }

    fn schedule_uploads(&mut self) {
        while self.uploads.len() < self.settings.parallelism {
            let Some((index, ciphertext)) = self.encrypt_queue.pop_front() else {
                break;
            };
            let upload = self.upload_chunk(index, ciphertext);
            self.uploads.push_back(upload);
        }
    }

    /// Store one chunk, retrying transient failures with the same ciphertext.
    fn upload_chunk(&self, index: u64, ciphertext: Bytes) -> UploadFuture {
        let transport = Arc::clone(&self.transport);
        let progress = Arc::clone(&self.progress);
        let file_id = self.subject.file_id.clone();
        let offset = index * self.subject.chunk_size_with_overhead();
        let len = ciphertext.len() as u64;
        let policy = RetryPolicy::bounded(self.settings.max_upload_attempts, self.settings.upload_retry_delay());

        async move {
            debug!(file_id = %file_id, index, offset, "uploading chunk");
            retry_if(
                &policy,
                "chunk upload",
                || {
                    progress.note_request();
                    transport.upload_chunk(&file_id, offset, ciphertext.clone())
                },
                KegError::is_transient,
            )
            .await?;
            Ok((index, len))
        }
        .boxed()
    }

    fn confirm(&mut self, index: u64, len: u64) -> KegResult<()> {
        self.confirmed_chunks = index + 1;
        let done = self.progress.add_done(len);
        if let Some(store) = &self.resume {
            store.put(&self.descriptor())?;
        }
        if let Some(callback) = &self.on_progress {
            callback(done, self.subject.size_with_overhead, &self.subject.file_id);
        }
        Ok(())
    }
}

#[async_trait]
impl Pipeline for Uploader {
    fn direction(&self) -> TransferDirection {
        TransferDirection::Upload
    }

    fn file_id(&self) -> &str {
        &self.subject.file_id
    }

    async fn begin(&mut self) -> KegResult<()> {
        if self.confirmed_chunks > 0 {
            info!(
                file_id = %self.subject.file_id,
                whole_chunks = self.confirmed_chunks,
                total_chunks = self.total_chunks,
                "resuming upload"
            );
        }
        if let Some(store) = &self.resume {
            store.put(&self.descriptor())?;
        }
        Ok(())
    }

    async fn step(&mut self, cancel: &CancellationToken) -> KegResult<Step> {
        let read_one = self.next_chunk < self.total_chunks && !self.encrypt_queue_full();
        if read_one {
            self.read_and_encrypt().await?;
        }
        self.schedule_uploads();
        if self.confirmed_chunks >= self.total_chunks {
            return Ok(Step::Done);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KegError::Cancelled),
            Some(stored) = self.uploads.next() => {
                let (index, len) = stored?;
                self.confirm(index, len)?;
                Ok(Step::Advanced)
            }
            _ = std::future::ready(()), if read_one => Ok(Step::Advanced),
        }
    }

    async fn release(&mut self) -> KegResult<()> {
        match self.source.take() {
            Some(mut source) => source.close().await,
            None => Ok(()),
        }
    }

    async fn cleanup(&mut self, outcome: &KegResult<()>) {
        self.uploads = FuturesOrdered::new();
        self.encrypt_queue.clear();

        if !discards_descriptor(outcome, self.session.as_ref()) {
            debug!(file_id = %self.subject.file_id, "keeping resume descriptor");
            return;
        }
        if let Some(store) = &self.resume {
            if let Err(e) = store.remove(TransferDirection::Upload, &self.subject.file_id) {
                warn!(file_id = %self.subject.file_id, "failed to clear resume descriptor: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::stream::MemorySource;
    use kegs_crypto::{decrypt_chunk, generate_key};

    const CHUNK: u64 = 32;

    fn settings() -> UploadConfig {
        UploadConfig {
            parallelism: 2,
            max_encrypt_buffer_size: 2 * (CHUNK + CHUNK_OVERHEAD as u64),
            queue_parallelism: 1,
            max_upload_attempts: 3,
            upload_retry_delay_ms: 1,
        }
    }

    fn uploader(store: Arc<MemoryStore>, plain: &[u8], key: &SymmetricKey) -> Uploader {
        let subject = FileSubject::for_plaintext("up", plain.len() as u64, CHUNK, CHUNK_OVERHEAD as u64);
        Uploader::new(
            store,
            subject,
            key.clone(),
            Path::new("/tmp/in"),
            Box::new(MemorySource::new(plain.to_vec())),
            settings(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn stored_blob_decrypts_per_chunk() {
        let plain: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let key = generate_key();
        let store = Arc::new(MemoryStore::new());

        uploader(Arc::clone(&store), &plain, &key).start().wait().await.unwrap();

        let blob = store.blob("up").unwrap();
        let stride = (CHUNK + CHUNK_OVERHEAD as u64) as usize;
        assert_eq!(blob.len(), 200 + 7 * CHUNK_OVERHEAD);

        let nonces = NonceGenerator::new(0);
        let mut recovered = Vec::new();
        for (i, chunk) in blob.chunks(stride).enumerate() {
            recovered.extend(decrypt_chunk(chunk, &key, &nonces.nonce_for(i as u64)).unwrap());
        }
        assert_eq!(recovered, plain);
    }

    #[tokio::test]
    async fn descriptor_cleared_on_success() {
        let plain = vec![9u8; 100];
        let key = generate_key();
        let store = Arc::new(MemoryStore::new());
        let resume = ResumeStore::in_memory();

        let up = uploader(store, &plain, &key).with_resume_store(resume.clone());
        up.start().wait().await.unwrap();
        assert_eq!(resume.get(TransferDirection::Upload, "up").unwrap(), None);
    }

    #[tokio::test]
    async fn progress_reaches_total() {
        let plain = vec![1u8; 150];
        let key = generate_key();
        let store = Arc::new(MemoryStore::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let up = uploader(store, &plain, &key).on_progress(Box::new(move |done: u64, total: u64, _file: &str| {
            sink.lock().unwrap().push((done, total));
        }));
        let progress = up.progress();
        up.start().wait().await.unwrap();

        let total = 150 + 5 * CHUNK_OVERHEAD as u64;
        assert_eq!(progress.done(), total);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.last(), Some(&(total, total)));
    }

    #[test]
    fn rejects_size_mismatch() {
        let subject = FileSubject::for_plaintext("up", 10, CHUNK, CHUNK_OVERHEAD as u64);
        let result = Uploader::new(
            Arc::new(MemoryStore::new()),
            subject,
            generate_key(),
            Path::new("/tmp/in"),
            Box::new(MemorySource::new(vec![0u8; 11])),
            settings(),
        );
        assert!(matches!(result, Err(KegError::Config(_))));
    }

    #[test]
    fn rejects_stored_size_smaller_than_overhead() {
        let subject = FileSubject {
            file_id: "up".into(),
            chunk_size: CHUNK,
            chunk_overhead: CHUNK_OVERHEAD as u64,
            size_with_overhead: 5,
        };
        let result = Uploader::new(
            Arc::new(MemoryStore::new()),
            subject,
            generate_key(),
            Path::new("/tmp/in"),
            Box::new(MemorySource::new(vec![0u8; 5])),
            settings(),
        );
        assert!(matches!(result, Err(KegError::Config(_))));
    }
}
