//! Chunked, resumable, decrypting downloader.
//!
//! Stored blobs are a sequence of encrypted chunks of
//! `chunk_size + chunk_overhead` bytes (the last one may be shorter). The
//! downloader fetches whole-chunk-aligned byte ranges with bounded
//! parallelism, splits each range into chunks, decrypts them strictly in
//! order with per-index nonces, and appends the plaintext to its sink.
//!
//! Flow control:
//!   - at most `parallelism` range fetches are in flight,
//!   - no new fetch starts while the decrypt queue is over budget,
//!   - one sink write is pending at a time.

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesOrdered, StreamExt};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use async_trait::async_trait;
use kegs_core::config::DownloadConfig;
use kegs_core::types::{FileSubject, ResumeDescriptor, TransferDirection};
use kegs_core::{KegError, KegResult};
use kegs_crypto::{decrypt_chunk, NonceGenerator, SymmetricKey, CHUNK_OVERHEAD};

use super::{discards_descriptor, Pipeline, ProgressFn, Step, TransferHandle, TransferProgress};
use crate::remote::ChunkTransport;
use crate::resume::ResumeStore;
use crate::retry::{retry_if, RetryPolicy};
use crate::stream::ChunkSink;

type WriteFuture = BoxFuture<'static, (Box<dyn ChunkSink>, KegResult<()>)>;
type FetchFuture = BoxFuture<'static, KegResult<Bytes>>;

/// Largest whole number of stored chunks that fits in `max_fetch` bytes.
pub fn batch_size(max_fetch: u64, chunk_size_with_overhead: u64) -> u64 {
    if chunk_size_with_overhead == 0 {
        return 0;
    }
    (max_fetch / chunk_size_with_overhead) * chunk_size_with_overhead
}

pub struct Downloader {
    subject: FileSubject,
    key: SymmetricKey,
    local_path: PathBuf,
    transport: Arc<dyn ChunkTransport>,
    settings: DownloadConfig,
    resume: Option<ResumeStore>,
    on_progress: Option<ProgressFn>,
    progress: Arc<TransferProgress>,
    cancel: CancellationToken,
    session: Option<CancellationToken>,

    sink: Option<Box<dyn ChunkSink>>,
    pending_write: Option<WriteFuture>,
    fetches: FuturesOrdered<FetchFuture>,
    decrypt_queue: VecDeque<Bytes>,
    nonces: NonceGenerator,

    chunk_size_with_overhead: u64,
    batch_size: u64,
    download_pos: u64,
    whole_chunks_completed: u64,
    partial_chunk_size: u64,
    no_more_chunks: bool,
}

impl Downloader {
    pub fn new(
        transport: Arc<dyn ChunkTransport>,
        subject: FileSubject,
        key: SymmetricKey,
        local_path: &Path,
        sink: Box<dyn ChunkSink>,
        settings: DownloadConfig,
    ) -> KegResult<Self> {
        if subject.chunk_overhead != CHUNK_OVERHEAD as u64 {
            return Err(KegError::Config(format!(
                "chunk overhead {} does not match cipher overhead {CHUNK_OVERHEAD}",
                subject.chunk_overhead
            )));
        }
        subject.plain_size()?;
        let chunk_size_with_overhead = subject.chunk_size_with_overhead();
        let batch = batch_size(settings.max_download_chunk_size, chunk_size_with_overhead);
        if subject.chunk_size == 0 || batch == 0 {
            return Err(KegError::Config(format!(
                "max_download_chunk_size {} cannot hold one {chunk_size_with_overhead}-byte chunk",
                settings.max_download_chunk_size
            )));
        }

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
            sink: Some(sink),
            pending_write: None,
            fetches: FuturesOrdered::new(),
            decrypt_queue: VecDeque::new(),
            nonces: NonceGenerator::new(0),
            chunk_size_with_overhead,
            batch_size: batch,
            download_pos: 0,
            whole_chunks_completed: 0,
            partial_chunk_size: 0,
            no_more_chunks: false,
        })
    }

    /// Continue after `descriptor.whole_chunks_completed` chunks, discarding
    /// the first `partial_chunk_size` plaintext bytes of the next chunk
    /// (they are already in the sink).
    pub fn resume_from(mut self, descriptor: &ResumeDescriptor) -> Self {
        let whole = descriptor.whole_chunks_completed;
        self.whole_chunks_completed = whole;
        self.partial_chunk_size = descriptor.partial_chunk_size;
        self.nonces = NonceGenerator::new(whole);
        self.download_pos = whole
            .saturating_mul(self.chunk_size_with_overhead)
            .min(self.subject.size_with_overhead);
        self.progress = Arc::new(TransferProgress::new(
            self.subject.size_with_overhead,
            self.download_pos,
        ));
        self
    }

    /// Persist a resume descriptor while the download runs.
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

    pub fn batch_size(&self) -> u64 {
        self.batch_size
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
            direction: TransferDirection::Download,
            whole_chunks_completed: self.whole_chunks_completed,
            partial_chunk_size: self.partial_chunk_size,
        }
    }

    fn decrypt_queue_full(&self) -> bool {
        let queued = self.decrypt_queue.len() as u64 * (self.chunk_size_with_overhead + 1);
        queued > self.settings.max_decrypt_buffer_size * self.settings.parallelism as u64
    }

    fn schedule_fetches(&mut self) {
        while !self.no_more_chunks
            && !self.decrypt_queue_full()
            && self.fetches.len() < self.settings.parallelism
        {
            let remaining = self.subject.size_with_overhead.saturating_sub(self.download_pos);
            let size = self.batch_size.min(remaining);
            if size == 0 {
                self.no_more_chunks = true;
                break;
            }
            debug!(
                file_id = %self.subject.file_id,
                start = self.download_pos,
                size,
                "fetching range"
            );
            let fetch = self.fetch_range(self.download_pos, size);
            self.fetches.push_back(fetch);
            self.download_pos += size;
        }
    }

    /// Fetch `size` bytes at `start`. Transient failures and short reads are
    /// retried in place; a locked range is requested again from scratch.
    fn fetch_range(&self, start: u64, size: u64) -> FetchFuture {
        let transport = Arc::clone(&self.transport);
        let progress = Arc::clone(&self.progress);
        let file_id = self.subject.file_id.clone();
        let policy = RetryPolicy::bounded(self.settings.max_fetch_attempts, self.settings.fetch_retry_delay());

        async move {
            retry_if(
                &policy,
                "locked range",
                || fetch_exact(transport.as_ref(), &file_id, start, size, &policy, &progress),
                |e| matches!(e, KegError::Locked(_)),
            )
            .await
        }
        .boxed()
    }

    fn enqueue(&mut self, bytes: Bytes) {
        let len = bytes.len() as u64;
        let mut offset = 0u64;
        while offset < len {
            let end = (offset + self.chunk_size_with_overhead).min(len);
            self.decrypt_queue
                .push_back(bytes.slice(offset as usize..end as usize));
            offset = end;
        }

        let queued: u64 = self.decrypt_queue.iter().map(|c| c.len() as u64).sum();
        self.progress.note_buffered(queued);
        let done = self.progress.add_done(len);
        if let Some(callback) = &self.on_progress {
            callback(done, self.subject.size_with_overhead, &self.subject.file_id);
        }
    }

    /// Decrypt the next queued chunk and start writing it, unless a write is
    /// already pending.
    fn schedule_write(&mut self) -> KegResult<()> {
        if self.pending_write.is_some() {
            return Ok(());
        }
        let Some(chunk) = self.decrypt_queue.pop_front() else {
            return Ok(());
        };

        let index = self.nonces.chunk_id();
        let nonce = self.nonces.next();
        let mut plaintext = decrypt_chunk(&chunk, &self.key, &nonce)
            .map_err(|e| KegError::Crypto(format!("chunk {index}: {e:#}")))?;

        if self.partial_chunk_size > 0 {
            let skip = self.partial_chunk_size as usize;
            if skip > plaintext.len() {
                return Err(KegError::Other(format!(
                    "resume offset {skip} is past the end of chunk {index}"
                )));
            }
            plaintext.drain(..skip);
            self.partial_chunk_size = 0;
        }

        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| KegError::Storage("download sink already released".into()))?;
        self.pending_write = Some(
            async move {
                let written = sink.write_all(&plaintext).await;
                (sink, written)
            }
            .boxed(),
        );
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.no_more_chunks
            && self.fetches.is_empty()
            && self.decrypt_queue.is_empty()
            && self.pending_write.is_none()
    }
}

async fn fetch_exact(
    transport: &dyn ChunkTransport,
    file_id: &str,
    start: u64,
    size: u64,
    policy: &RetryPolicy,
    progress: &TransferProgress,
) -> KegResult<Bytes> {
    retry_if(
        policy,
        "range fetch",
        move || async move {
            progress.note_request();
            let bytes = transport
                .fetch_chunk_range(file_id, start, start + size - 1)
                .await?;
            if bytes.len() as u64 != size {
                return Err(KegError::SizeMismatch {
                    expected: size,
                    actual: bytes.len() as u64,
                });
            }
            Ok(bytes)
        },
        KegError::is_transient,
    )
    .await
}

async fn next_write(slot: &mut Option<WriteFuture>) -> (Box<dyn ChunkSink>, KegResult<()>) {
    match slot.as_mut() {
        Some(write) => write.await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Pipeline for Downloader {
    fn direction(&self) -> TransferDirection {
        TransferDirection::Download
    }

    fn file_id(&self) -> &str {
        &self.subject.file_id
    }

    async fn begin(&mut self) -> KegResult<()> {
        if self.whole_chunks_completed > 0 || self.partial_chunk_size > 0 {
            info!(
                file_id = %self.subject.file_id,
                whole_chunks = self.whole_chunks_completed,
                partial = self.partial_chunk_size,
                "resuming download"
            );
        }
        if let Some(store) = &self.resume {
            store.put(&self.descriptor())?;
        }
        Ok(())
    }

    async fn step(&mut self, cancel: &CancellationToken) -> KegResult<Step> {
        self.schedule_fetches();
        self.schedule_write()?;
        if self.is_finished() {
            return Ok(Step::Done);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(KegError::Cancelled),
            (sink, written) = next_write(&mut self.pending_write) => {
                self.pending_write = None;
                self.sink = Some(sink);
                written?;
                Ok(Step::Advanced)
            }
            Some(fetched) = self.fetches.next() => {
                self.enqueue(fetched?);
                Ok(Step::Advanced)
            }
        }
    }

    async fn release(&mut self) -> KegResult<()> {
        if let Some(write) = self.pending_write.take() {
            let (sink, written) = write.await;
            self.sink = Some(sink);
            if let Err(e) = written {
                warn!(file_id = %self.subject.file_id, "final chunk write failed: {e}");
            }
        }
        match self.sink.take() {
            Some(mut sink) => sink.close().await,
            None => Ok(()),
        }
    }

    async fn cleanup(&mut self, outcome: &KegResult<()>) {
        // dropping the futures aborts in-flight requests
        self.fetches = FuturesOrdered::new();
        self.decrypt_queue.clear();

        if !discards_descriptor(outcome, self.session.as_ref()) {
            debug!(file_id = %self.subject.file_id, "keeping resume descriptor");
            return;
        }
        if let Some(store) = &self.resume {
            if let Err(e) = store.remove(TransferDirection::Download, &self.subject.file_id) {
                warn!(file_id = %self.subject.file_id, "failed to clear resume descriptor: {e}");
            }
        }
    }
}
