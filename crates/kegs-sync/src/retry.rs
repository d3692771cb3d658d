//! Retry with a fixed delay, plus a keyed registry that de-duplicates
//! concurrent retries of the same logical operation.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use kegs_core::{KegError, KegResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// `None` retries until the operation succeeds
    pub max_attempts: Option<u32>,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            delay,
        }
    }

    pub fn unbounded(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay,
        }
    }
}

/// Errors that no amount of retrying will fix.
pub fn is_fatal(err: &KegError) -> bool {
    err.is_disconnected()
        || err.is_cancelled()
        || matches!(
            err,
            KegError::TamperDetected(_)
                | KegError::VersionConflict { .. }
                | KegError::Crypto(_)
                | KegError::Config(_)
        )
}

/// Run `op` until it succeeds, the attempt bound is hit, or it fails with a
/// fatal error. Fatal errors propagate immediately.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> KegResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KegResult<T>>,
{
    retry_if(policy, label, op, |e| !is_fatal(e)).await
}

/// Like [`retry`], but only errors accepted by `should_retry` are retried.
pub async fn retry_if<T, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
    should_retry: P,
) -> KegResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KegResult<T>>,
    P: Fn(&KegError) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_fatal(&e) || !should_retry(&e) => return Err(e),
            Err(e) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    warn!(label, attempt, error = %e, "giving up after retries");
                    return Err(e);
                }
                debug!(label, attempt, error = %e, "retrying");
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

type SharedRun<T> = Shared<BoxFuture<'static, KegResult<T>>>;

/// Keyed retry registry: while a retry for a key is in flight, further
/// requests for that key join it instead of starting another.
pub struct KeyedRetry<T: Clone + Send + Sync + 'static> {
    policy: RetryPolicy,
    in_flight: Arc<Mutex<HashMap<String, SharedRun<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> KeyedRetry<T> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Retry `op` under `key`, or join the run already in flight for it.
    ///
    /// The run is driven on its own task, so it completes (and frees the key)
    /// even if every caller drops the returned future.
    pub fn run<F, Fut>(&self, key: &str, op: F) -> SharedRun<T>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = KegResult<T>> + Send + 'static,
    {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(existing) = in_flight.get(key) {
            debug!(key, "joining in-flight retry");
            return existing.clone();
        }

        let registry = Arc::clone(&self.in_flight);
        let policy = self.policy.clone();
        let owned_key = key.to_string();
        let run = async move {
            let result = retry(&policy, &owned_key, op).await;
            registry.lock().unwrap().remove(&owned_key);
            result
        }
        .boxed()
        .shared();

        in_flight.insert(key.to_string(), run.clone());
        tokio::spawn(run.clone());
        run
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.in_flight.lock().unwrap().contains_key(key)
    }
}
