//! File-level transfer orchestration.
//!
//! Wraps the downloader and uploader with local-file handling, keyed retry
//! (one logical transfer per file and direction at a time), a serial upload
//! queue, and startup recovery of transfers a previous process left behind.

use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use kegs_core::types::{resume_key, FileSubject, ResumeDescriptor, TransferDirection};
use kegs_core::KegResult;
use kegs_crypto::SymmetricKey;

use crate::context::SyncContext;
use crate::queue::TaskQueue;
use crate::stream::{FileSink, FileSource};

/// What the manager needs to know about a remote file.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub subject: FileSubject,
    pub key: SymmetricKey,
}

/// Resolves file ids found in the resume store to their remote description.
pub trait FileLookup: Send + Sync {
    fn lookup(&self, file_id: &str) -> Option<FileEntry>;
}

impl FileLookup for HashMap<String, FileEntry> {
    fn lookup(&self, file_id: &str) -> Option<FileEntry> {
        self.get(file_id).cloned()
    }
}

/// Transfers restarted by [`TransferManager::resume_interrupted`].
#[derive(Default)]
pub struct ResumeReport {
    pub downloads: Vec<(String, BoxFuture<'static, KegResult<()>>)>,
    pub uploads: Vec<(String, oneshot::Receiver<KegResult<()>>)>,
    /// Download descriptors removed because their file is no longer known
    pub stale_removed: usize,
    /// Upload descriptors left in place because their file is not known yet
    pub skipped: usize,
}

pub struct TransferManager {
    ctx: Arc<SyncContext>,
    uploads: TaskQueue,
}

impl TransferManager {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        let uploads = TaskQueue::new(ctx.config().upload.queue_parallelism);
        Self { ctx, uploads }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn upload_queue(&self) -> &TaskQueue {
        &self.uploads
    }

    /// Download `entry` to `local_path`. With `resume`, plaintext already in
    /// the file is kept and the transfer continues after it.
    ///
    /// A second request for the same file joins the one in flight.
    pub fn download(&self, entry: FileEntry, local_path: PathBuf, resume: bool) -> BoxFuture<'static, KegResult<()>> {
        let key = resume_key(TransferDirection::Download, &entry.subject.file_id);
        let ctx = Arc::clone(&self.ctx);
        let mut first_attempt = true;

        self.ctx
            .retries()
            .run(&key, move || {
                // later attempts always continue from what is on disk
                let resume_now = resume || !first_attempt;
                first_attempt = false;
                let ctx = Arc::clone(&ctx);
                let entry = entry.clone();
                let path = local_path.clone();
                async move { run_download(&ctx, entry, &path, resume_now).await }
            })
            .boxed()
    }

    /// Queue an upload of `local_path`. Uploads run one at a time (or
    /// `upload.queue_parallelism` at a time) and resume from a stored
    /// descriptor when there is one.
    pub fn upload(&self, entry: FileEntry, local_path: PathBuf) -> oneshot::Receiver<KegResult<()>> {
        self.enqueue_upload(entry, local_path, false)
    }

    fn enqueue_upload(&self, entry: FileEntry, local_path: PathBuf, resumed: bool) -> oneshot::Receiver<KegResult<()>> {
        let ctx = Arc::clone(&self.ctx);
        self.uploads.add_task(async move {
            let file_id = entry.subject.file_id.clone();
            if resumed && ctx.resume().get(TransferDirection::Upload, &file_id)?.is_none() {
                debug!(file_id = %file_id, "upload already finished, nothing to resume");
                return Ok(());
            }

            let key = resume_key(TransferDirection::Upload, &file_id);
            let run_ctx = Arc::clone(&ctx);
            ctx.retries()
                .run(&key, move || {
                    let ctx = Arc::clone(&run_ctx);
                    let entry = entry.clone();
                    let path = local_path.clone();
                    async move { run_upload(&ctx, entry, &path).await }
                })
                .await
        })
    }

    /// Restart every transfer recorded in the resume store.
    ///
    /// Downloads of files `files` no longer knows are abandoned and their
    /// descriptors removed; uploads of unknown files are left for later.
    pub fn resume_interrupted(&self, files: &dyn FileLookup) -> KegResult<ResumeReport> {
        let mut report = ResumeReport::default();

        for descriptor in self.ctx.resume().pending()? {
            let file_id = descriptor.file_id.clone();
            match (descriptor.direction, files.lookup(&file_id)) {
                (TransferDirection::Download, Some(entry)) => {
                    info!(file_id = %file_id, "resuming interrupted download");
                    let run = self.download(entry, descriptor.local_path.clone(), true);
                    report.downloads.push((file_id, run));
                }
                (TransferDirection::Download, None) => {
                    warn!(file_id = %file_id, "dropping resume descriptor for unknown download");
                    self.ctx.resume().remove(TransferDirection::Download, &file_id)?;
                    report.stale_removed += 1;
                }
                (TransferDirection::Upload, Some(entry)) => {
                    info!(file_id = %file_id, "resuming interrupted upload");
                    let rx = self.enqueue_upload(entry, descriptor.local_path.clone(), true);
                    report.uploads.push((file_id, rx));
                }
                (TransferDirection::Upload, None) => {
                    debug!(file_id = %file_id, "upload file not known yet, keeping descriptor");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    /// Cancel all running transfers.
    pub fn shutdown(&self) {
        self.ctx.shutdown();
    }
}

async fn run_download(ctx: &SyncContext, entry: FileEntry, path: &Path, resume: bool) -> KegResult<()> {
    let plain_size = entry.subject.plain_size()?;
    let existing = if resume {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() <= plain_size => Some(meta.len()),
            Ok(meta) => {
                warn!(path = %path.display(), len = meta.len(), "local file larger than remote, restarting");
                None
            }
            Err(_) => None,
        }
    } else {
        None
    };

    let downloader = match existing {
        Some(len) => {
            let descriptor = ResumeDescriptor::new(entry.subject.file_id.clone(), path.to_path_buf(), TransferDirection::Download)
                .with_local_len(len, entry.subject.chunk_size);
            let sink = FileSink::append(path).await?;
            ctx.downloader(entry.subject, entry.key, path, Box::new(sink))?
                .resume_from(&descriptor)
        }
        None => {
            let sink = FileSink::create(path).await?;
            ctx.downloader(entry.subject, entry.key, path, Box::new(sink))?
        }
    };
    downloader.start().wait().await
}

async fn run_upload(ctx: &SyncContext, entry: FileEntry, path: &Path) -> KegResult<()> {
    let source = FileSource::open(path).await?;
    let stored = ctx
        .resume()
        .get(TransferDirection::Upload, &entry.subject.file_id)?;

    let mut uploader = ctx.uploader(entry.subject, entry.key, path, Box::new(source))?;
    if let Some(descriptor) = stored {
        uploader = uploader.resume_from(&descriptor);
    }
    uploader.start().wait().await
}
