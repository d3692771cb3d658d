//! Bounded-parallelism task queue.
//!
//! Tasks are futures queued in FIFO order; at most `parallelism` of them run
//! at once. A task that fails or panics is logged and counted as completed,
//! so one bad task never wedges the queue.

use futures::future::{BoxFuture, FutureExt};
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{error, warn};

type QueuedTask = BoxFuture<'static, ()>;

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<QueuedTask>,
    running: usize,
    peak_running: usize,
}

struct QueueInner {
    parallelism: usize,
    throttle: Duration,
    state: Mutex<QueueState>,
    idle: Notify,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(parallelism: usize) -> Self {
        Self::with_throttle(parallelism, Duration::ZERO)
    }

    /// `throttle` is waited before each task starts.
    pub fn with_throttle(parallelism: usize, throttle: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                parallelism: parallelism.max(1),
                throttle,
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Enqueue a task and try to start it. The receiver yields the task's
    /// own result; it is dropped without a value if the task panics.
    ///
    /// Must be called inside a tokio runtime.
    pub fn add_task<F, T, E>(&self, task: F) -> oneshot::Receiver<Result<T, E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped = async move {
            let result = task.await;
            if let Err(e) = &result {
                warn!(error = %e, "queued task failed");
            }
            let _ = tx.send(result);
        }
        .boxed();

        self.inner.state.lock().unwrap().backlog.push_back(wrapped);
        QueueInner::dispatch(&self.inner);
        rx
    }

    pub fn running(&self) -> usize {
        self.inner.state.lock().unwrap().running
    }

    /// Queued plus running tasks.
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.backlog.len() + state.running
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest number of tasks ever observed running at once.
    pub fn peak_running(&self) -> usize {
        self.inner.state.lock().unwrap().peak_running
    }

    pub fn parallelism(&self) -> usize {
        self.inner.parallelism
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl QueueInner {
    fn dispatch(inner: &Arc<QueueInner>) {
        let mut state = inner.state.lock().unwrap();
        while state.running < inner.parallelism {
            let Some(task) = state.backlog.pop_front() else {
                break;
            };
            state.running += 1;
            state.peak_running = state.peak_running.max(state.running);

            let queue = Arc::clone(inner);
            tokio::spawn(async move {
                if !queue.throttle.is_zero() {
                    tokio::time::sleep(queue.throttle).await;
                }
                // separate task so a panic stays contained
                if let Err(e) = tokio::spawn(task).await {
                    error!("queued task panicked: {e}");
                }
                QueueInner::complete(&queue);
            });
        }
    }

    fn complete(inner: &Arc<QueueInner>) {
        {
            let mut state = inner.state.lock().unwrap();
            state.running -= 1;
            if state.running == 0 && state.backlog.is_empty() {
                inner.idle.notify_waiters();
            }
        }
        QueueInner::dispatch(inner);
    }
}
