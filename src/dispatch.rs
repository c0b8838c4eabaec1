use log::{debug, warn};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

use crate::config::RetryConfig;
use crate::error::Error;

/// Fire-and-forget runner for collaborator calls. Tasks start after the
/// caller has committed its own state; a failure is logged and nothing else.
pub struct SideEffects {
    pending: Mutex<Vec<JoinHandle<()>>>,
    retry: RetryConfig,
    failures: Arc<AtomicU64>,
}

impl SideEffects {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            retry,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn spawn<F>(&self, label: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        let label = label.into();
        let failures = self.failures.clone();
        let handle = tokio::spawn(async move {
            match task.await {
                Ok(()) => debug!("{} delivered", label),
                Err(e) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!("{}", delivery_failure(&label, 1, &e));
                }
            }
        });
        self.track(handle);
    }

    /// Like `spawn`, but re-runs the call with exponential backoff up to the
    /// configured number of attempts.
    pub fn spawn_with_retry<F, Fut>(&self, label: impl Into<String>, call: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let label = label.into();
        let retry = self.retry.clone();
        let failures = self.failures.clone();
        let handle = tokio::spawn(async move {
            let mut attempt = 1;
            loop {
                match call().await {
                    Ok(()) => {
                        debug!("{} delivered on attempt {}", label, attempt);
                        return;
                    }
                    Err(e) if attempt >= retry.max_attempts => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        warn!("{}", delivery_failure(&label, attempt, &e));
                        return;
                    }
                    Err(e) => {
                        debug!("{} attempt {} failed: {}", label, attempt, e);
                        sleep(backoff(&retry, attempt)).await;
                        attempt += 1;
                    }
                }
            }
        });
        self.track(handle);
    }

    /// Waits for every task submitted so far.
    pub async fn drain(&self) {
        loop {
            let handles = std::mem::take(&mut *self.lock_pending());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("side effect task aborted: {}", e);
                }
            }
        }
    }

    /// Calls that gave up, counted since construction.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.lock_pending().iter().filter(|h| !h.is_finished()).count()
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut pending = self.lock_pending();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn delivery_failure(label: &str, attempts: u32, reason: &str) -> Error {
    Error::ExternalService(format!("{} failed after {} attempt(s): {}", label, attempts, reason))
}

fn backoff(retry: &RetryConfig, attempt: u32) -> Duration {
    let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
    Duration::from_millis(retry.backoff_ms.saturating_mul(factor))
}
