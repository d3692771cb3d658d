//! Shared fixtures for kegs-sync integration tests: a scripted transport
//! with fault injection and request logging, a slow sink, and helpers to
//! build encrypted blobs.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kegs_core::config::{DownloadConfig, UploadConfig};
use kegs_core::{KegError, KegResult};
use kegs_crypto::{encrypt_chunk, NonceGenerator, SymmetricKey};
use kegs_sync::memory::MemoryStore;
use kegs_sync::remote::ChunkTransport;
use kegs_sync::stream::ChunkSink;

/// A failure to inject into the next transport call.
#[derive(Debug, Clone)]
pub enum Fault {
    Transport,
    Locked,
    /// Return one byte fewer than requested
    Short,
    Disconnected,
}

/// Wraps a [`MemoryStore`] and records or perturbs every request.
pub struct ScriptedTransport {
    pub inner: Arc<MemoryStore>,
    fetch_log: Mutex<Vec<(u64, u64)>>,
    upload_log: Mutex<Vec<(u64, Bytes)>>,
    fetch_faults: Mutex<VecDeque<Fault>>,
    upload_faults: Mutex<VecDeque<Fault>>,
    /// Uploads at or past this offset fail with `Disconnected`
    upload_cutoff: Mutex<Option<u64>>,
    fetch_delay: Duration,
    upload_delay: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self::with_fetch_delay(inner, Duration::ZERO)
    }

    pub fn with_fetch_delay(inner: Arc<MemoryStore>, fetch_delay: Duration) -> Self {
        Self {
            inner,
            fetch_log: Mutex::new(Vec::new()),
            upload_log: Mutex::new(Vec::new()),
            fetch_faults: Mutex::new(VecDeque::new()),
            upload_faults: Mutex::new(VecDeque::new()),
            upload_cutoff: Mutex::new(None),
            fetch_delay,
            upload_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    pub fn push_fetch_fault(&self, fault: Fault) {
        self.fetch_faults.lock().unwrap().push_back(fault);
    }

    pub fn push_upload_fault(&self, fault: Fault) {
        self.upload_faults.lock().unwrap().push_back(fault);
    }

    pub fn cut_uploads_at(&self, offset: Option<u64>) {
        *self.upload_cutoff.lock().unwrap() = offset;
    }

    pub fn fetches(&self) -> Vec<(u64, u64)> {
        self.fetch_log.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(u64, Bytes)> {
        self.upload_log.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

fn fault_error(fault: &Fault) -> KegError {
    match fault {
        Fault::Transport => KegError::Transport("connection reset".into()),
        Fault::Locked => KegError::from_status(423, "range locked"),
        Fault::Disconnected => KegError::Disconnected,
        Fault::Short => KegError::Other("short is applied to the response".into()),
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChunkTransport for ScriptedTransport {
    async fn fetch_chunk_range(&self, file_id: &str, start: u64, end: u64) -> KegResult<Bytes> {
        self.fetch_log.lock().unwrap().push((start, end));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }

        let fault = self.fetch_faults.lock().unwrap().pop_front();
        match fault {
            None => self.inner.fetch_chunk_range(file_id, start, end).await,
            Some(Fault::Short) => {
                let bytes = self.inner.fetch_chunk_range(file_id, start, end).await?;
                Ok(bytes.slice(..bytes.len().saturating_sub(1)))
            }
            Some(other) => Err(fault_error(&other)),
        }
    }

    async fn upload_chunk(&self, file_id: &str, offset: u64, ciphertext: Bytes) -> KegResult<()> {
        self.upload_log.lock().unwrap().push((offset, ciphertext.clone()));
        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }

        if let Some(cutoff) = *self.upload_cutoff.lock().unwrap() {
            if offset >= cutoff {
                return Err(KegError::Disconnected);
            }
        }
        let fault = self.upload_faults.lock().unwrap().pop_front();
        if let Some(fault) = fault {
            return Err(fault_error(&fault));
        }
        self.inner.upload_chunk(file_id, offset, ciphertext).await
    }
}

/// A sink that sleeps before every write, so fetched data piles up.
pub struct SlowSink {
    pub data: Arc<Mutex<Vec<u8>>>,
    pub closes: Arc<AtomicUsize>,
    delay: Duration,
}

impl SlowSink {
    pub fn new(delay: Duration) -> Self {
        Self {
            data: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }
}

#[async_trait]
impl ChunkSink for SlowSink {
    async fn write_all(&mut self, data: &[u8]) -> KegResult<()> {
        tokio::time::sleep(self.delay).await;
        self.data.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) -> KegResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Deterministic test plaintext.
pub fn plaintext(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Encrypt `plain` the way the uploader stores it.
pub fn seal_blob(plain: &[u8], key: &SymmetricKey, chunk_size: usize) -> Vec<u8> {
    let mut nonces = NonceGenerator::new(0);
    let mut blob = Vec::new();
    for chunk in plain.chunks(chunk_size) {
        blob.extend(encrypt_chunk(chunk, key, &nonces.next()).expect("encrypt chunk"));
    }
    blob
}

pub fn download_config(parallelism: usize, max_fetch: u64, buffer: u64) -> DownloadConfig {
    DownloadConfig {
        parallelism,
        max_download_chunk_size: max_fetch,
        max_decrypt_buffer_size: buffer,
        max_fetch_attempts: 5,
        fetch_retry_delay_ms: 1,
    }
}

pub fn upload_config(parallelism: usize) -> UploadConfig {
    UploadConfig {
        parallelism,
        max_upload_attempts: 5,
        upload_retry_delay_ms: 1,
        ..UploadConfig::default()
    }
}
