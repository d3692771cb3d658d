//! Local byte streams owned by transfer pipelines.
//!
//! A downloader owns one [`ChunkSink`], an uploader one [`ChunkSource`].
//! Each is closed exactly once by the pipeline that owns it; dropping an
//! unclosed stream still releases the underlying file handle.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use kegs_core::{KegError, KegResult};

#[async_trait]
pub trait ChunkSink: Send {
    async fn write_all(&mut self, data: &[u8]) -> KegResult<()>;
    async fn close(&mut self) -> KegResult<()>;
}

#[async_trait]
pub trait ChunkSource: Send {
    /// Total plaintext bytes available.
    fn size(&self) -> u64;

    /// Read up to `len` bytes at `offset`; shorter only at end of stream.
    async fn read_at(&mut self, offset: u64, len: usize) -> KegResult<Vec<u8>>;

    async fn close(&mut self) -> KegResult<()>;
}

fn closed(path: &Path) -> KegError {
    KegError::Storage(format!("stream already closed: {}", path.display()))
}

pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
}

impl FileSink {
    /// Create (or truncate) the destination for a fresh download.
    pub async fn create(path: &Path) -> KegResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// Open for appending after the bytes a previous run already wrote.
    pub async fn append(path: &Path) -> KegResult<Self> {
        let file = OpenOptions::new().append(true).create(true).open(path).await?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn write_all(&mut self, data: &[u8]) -> KegResult<()> {
        let file = self.file.as_mut().ok_or_else(|| closed(&self.path))?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn close(&mut self) -> KegResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

pub struct FileSource {
    path: PathBuf,
    file: Option<File>,
    size: u64,
}

impl FileSource {
    pub async fn open(path: &Path) -> KegResult<Self> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            size,
        })
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> KegResult<Vec<u8>> {
        let file = self.file.as_mut().ok_or_else(|| closed(&self.path))?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn close(&mut self) -> KegResult<()> {
        self.file.take();
        Ok(())
    }
}

/// Shared view of an in-memory sink: its bytes and how often it was closed.
#[derive(Clone, Default)]
pub struct MemorySinkHandle {
    data: Arc<Mutex<Vec<u8>>>,
    closes: Arc<AtomicUsize>,
}

impl MemorySinkHandle {
    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct MemorySink {
    handle: MemorySinkHandle,
    open: bool,
}

impl MemorySink {
    pub fn new() -> (Self, MemorySinkHandle) {
        Self::with_prefix(Vec::new())
    }

    /// Start with bytes already "on disk", as a resumed download would.
    pub fn with_prefix(existing: Vec<u8>) -> (Self, MemorySinkHandle) {
        let handle = MemorySinkHandle {
            data: Arc::new(Mutex::new(existing)),
            closes: Arc::new(AtomicUsize::new(0)),
        };
        let sink = Self {
            handle: handle.clone(),
            open: true,
        };
        (sink, handle)
    }
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn write_all(&mut self, data: &[u8]) -> KegResult<()> {
        if !self.open {
            return Err(KegError::Storage("memory sink already closed".into()));
        }
        self.handle.data.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) -> KegResult<()> {
        self.open = false;
        self.handle.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemorySource {
    data: Bytes,
    closes: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> KegResult<Vec<u8>> {
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }

    async fn close(&mut self) -> KegResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
