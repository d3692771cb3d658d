//! Chunked transfer processor.
//!
//! A pipeline ([`Downloader`] or [`Uploader`]) is a state machine advanced one
//! step at a time by a single driver task. The driver:
//!   1. checks the cancellation token before every step,
//!   2. funnels any step error into one finish path,
//!   3. on finish releases the pipeline's byte stream, runs its cleanup hook,
//!      and settles the result exactly once.

pub mod download;
pub mod upload;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kegs_core::types::{TransferDirection, TransferState};
use kegs_core::{KegError, KegResult};

pub use download::Downloader;
pub use upload::Uploader;

/// Progress callback: `(bytes_done, bytes_total, file_id)`.
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

/// Counters shared between a running pipeline and its handle.
#[derive(Debug, Default)]
pub struct TransferProgress {
    pub bytes_done: AtomicU64,
    pub bytes_total: AtomicU64,
    /// Network requests issued (range fetches or chunk uploads), retries included
    pub requests: AtomicU64,
    /// Largest number of bytes ever held in the decrypt/encrypt queue
    pub peak_buffered: AtomicU64,
}

impl TransferProgress {
    pub fn new(total: u64, done: u64) -> Self {
        Self {
            bytes_done: AtomicU64::new(done),
            bytes_total: AtomicU64::new(total),
            ..Default::default()
        }
    }

    pub fn done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn peak_buffered(&self) -> u64 {
        self.peak_buffered.load(Ordering::Relaxed)
    }

    pub(crate) fn add_done(&self, bytes: u64) -> u64 {
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub(crate) fn note_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_buffered(&self, bytes: u64) {
        self.peak_buffered.fetch_max(bytes, Ordering::Relaxed);
    }
}

pub(crate) enum Step {
    Advanced,
    Done,
}

#[async_trait]
pub(crate) trait Pipeline: Send + 'static {
    fn direction(&self) -> TransferDirection;
    fn file_id(&self) -> &str;

    /// Runs once before the first step (persist the resume descriptor).
    async fn begin(&mut self) -> KegResult<()>;

    /// Advance by one unit of work. Must observe `cancel` at every wait.
    async fn step(&mut self, cancel: &CancellationToken) -> KegResult<Step>;

    /// Close the owned byte stream. Called exactly once, on every outcome.
    async fn release(&mut self) -> KegResult<()>;

    /// Direction-specific teardown after the stream is released.
    async fn cleanup(&mut self, outcome: &KegResult<()>);
}

/// Whether a settled transfer's resume descriptor should be removed.
///
/// Success and an explicit cancel remove it. Failures keep it, and so does a
/// cancel that came from `session` shutting down.
pub(crate) fn discards_descriptor(outcome: &KegResult<()>, session: Option<&CancellationToken>) -> bool {
    match outcome {
        Ok(()) => true,
        Err(KegError::Cancelled) => !session.is_some_and(|s| s.is_cancelled()),
        Err(_) => false,
    }
}

/// Caller's view of a running transfer.
pub struct TransferHandle {
    file_id: String,
    direction: TransferDirection,
    cancel: CancellationToken,
    state: watch::Receiver<TransferState>,
    result: oneshot::Receiver<KegResult<()>>,
    progress: Arc<TransferProgress>,
}

impl TransferHandle {
    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Request cancellation. In-flight requests are dropped and the
    /// transfer settles as `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> TransferState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferState> {
        self.state.clone()
    }

    pub fn progress(&self) -> &Arc<TransferProgress> {
        &self.progress
    }

    /// Wait for the transfer to settle.
    pub async fn wait(self) -> KegResult<()> {
        self.result
            .await
            .unwrap_or_else(|_| Err(KegError::Other("transfer task dropped".into())))
    }
}

/// Settles a transfer's outcome; the first call wins.
struct Settlement {
    result: Option<oneshot::Sender<KegResult<()>>>,
    state: watch::Sender<TransferState>,
}

impl Settlement {
    fn settle(&mut self, outcome: KegResult<()>) {
        let Some(tx) = self.result.take() else {
            return;
        };
        let state = match &outcome {
            Ok(()) => TransferState::Succeeded,
            Err(KegError::Cancelled) => TransferState::Cancelled,
            Err(e) => TransferState::Failed(e.to_string()),
        };
        self.state.send_replace(state);
        let _ = tx.send(outcome);
    }
}

/// Spawn the driver task for `pipeline`.
pub(crate) fn start(
    pipeline: Box<dyn Pipeline>,
    progress: Arc<TransferProgress>,
    cancel: CancellationToken,
) -> TransferHandle {
    let (state_tx, state_rx) = watch::channel(TransferState::Idle);
    let (result_tx, result_rx) = oneshot::channel();

    let handle = TransferHandle {
        file_id: pipeline.file_id().to_string(),
        direction: pipeline.direction(),
        cancel: cancel.clone(),
        state: state_rx,
        result: result_rx,
        progress,
    };

    state_tx.send_replace(TransferState::Running);
    let settlement = Settlement {
        result: Some(result_tx),
        state: state_tx,
    };
    tokio::spawn(run(pipeline, settlement, cancel));
    handle
}

async fn run(mut pipeline: Box<dyn Pipeline>, mut settlement: Settlement, cancel: CancellationToken) {
    let direction = pipeline.direction();
    let file_id = pipeline.file_id().to_string();
    info!(%direction, file_id = %file_id, "transfer started");

    let outcome = drive(pipeline.as_mut(), &cancel).await;
    finish(pipeline.as_mut(), &mut settlement, outcome).await;
}

async fn drive(pipeline: &mut dyn Pipeline, cancel: &CancellationToken) -> KegResult<()> {
    pipeline.begin().await?;
    loop {
        if cancel.is_cancelled() {
            return Err(KegError::Cancelled);
        }
        match pipeline.step(cancel).await? {
            Step::Advanced => tokio::task::yield_now().await,
            Step::Done => return Ok(()),
        }
    }
}

async fn finish(pipeline: &mut dyn Pipeline, settlement: &mut Settlement, outcome: KegResult<()>) {
    let direction = pipeline.direction();
    let file_id = pipeline.file_id().to_string();

    let released = pipeline.release().await;
    let outcome = match (outcome, released) {
        (Ok(()), Err(e)) => Err(e),
        (Err(e), Err(release_err)) => {
            warn!(%direction, file_id = %file_id, "stream release failed: {release_err}");
            Err(e)
        }
        (outcome, Ok(())) => outcome,
    };

    pipeline.cleanup(&outcome).await;

    match &outcome {
        Ok(()) => info!(%direction, file_id = %file_id, "transfer complete"),
        Err(KegError::Cancelled) => info!(%direction, file_id = %file_id, "transfer cancelled"),
        Err(e) => warn!(%direction, file_id = %file_id, "transfer failed: {e}"),
    }
    settlement.settle(outcome);
}
