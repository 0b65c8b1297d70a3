//! The exactly-once orchestrator.
//!
//! ```text
//! process(id, handler)
//!     │
//!     ├─ 1. store.get_state ──── terminal? ──► cached result
//!     ├─ 2. store.reserve ────── existing terminal? ──► cached result
//!     ├─ 3. lock.try_lock ────── held elsewhere? ──► wait, re-read once
//!     │        │                                      ├─ terminal ──► cached result
//!     │        │                                      └─ otherwise ─► "currently being processed"
//!     │        ▼ LockGuard (released on every exit path)
//!     │     re-read under lock ─ terminal ──► cached result
//!     │                        └ PROCESSING ─► "abandoned" (no re-run)
//!     ├─ 4. store.mark_processing   (crash-safety boundary)
//!     ├─ 5. handler()               (Err and panics captured)
//!     ├─ 6. store.mark_complete | store.mark_failed
//!     └─ 7. lock released
//! ```
//!
//! The guard keeps no state of its own. Every decision is re-validated against
//! the store before anything is written.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::lock::{DistributedLock, LockGuard};
use crate::model::{ProcessingResult, WebhookState, WebhookStatus};
use crate::store::{Reservation, WebhookStore};

/// Returned when another worker holds the lock and the record is still open
/// after the contention wait.
pub const CONTENDED_MESSAGE: &str = "Webhook is currently being processed";

/// Returned when the lock was free but the record is stuck in `PROCESSING`,
/// meaning an earlier holder's lease expired mid-execution.
pub const ABANDONED_MESSAGE: &str = "Webhook processing was abandoned and requires recovery";

const UNKNOWN_ERROR: &str = "Unknown error";

/// Runs a unit of work at most once per webhook id.
///
/// Cheap to clone; clones share the same store and lock.
#[derive(Clone)]
pub struct WebhookGuard {
    store: Arc<dyn WebhookStore>,
    lock: Arc<dyn DistributedLock>,
    config: GuardConfig,
}

impl WebhookGuard {
    pub fn new(store: Arc<dyn WebhookStore>, lock: Arc<dyn DistributedLock>) -> Self {
        Self::builder(store, lock).build()
    }

    pub fn builder(store: Arc<dyn WebhookStore>, lock: Arc<dyn DistributedLock>) -> WebhookGuardBuilder {
        WebhookGuardBuilder {
            store,
            lock,
            config: GuardConfig::default(),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn WebhookStore> {
        &self.store
    }

    /// Process `webhook_id` with the configured default timeout.
    pub async fn process<T, F, Fut>(&self, webhook_id: &str, handler: F) -> Result<ProcessingResult<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(webhook_id, None, handler).await
    }

    /// Process `webhook_id`, bounding the reservation window and lock lease by
    /// `timeout` instead of the default. A zero timeout means the default.
    ///
    /// The timeout does not limit how long the handler may run.
    pub async fn process_with_timeout<T, F, Fut>(
        &self,
        webhook_id: &str,
        timeout: Duration,
        handler: F,
    ) -> Result<ProcessingResult<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(webhook_id, Some(timeout), handler).await
    }

    #[tracing::instrument(name = "webhook_guard.process", skip_all, fields(webhook_id = %webhook_id))]
    async fn run<T, F, Fut>(
        &self,
        webhook_id: &str,
        requested: Option<Duration>,
        handler: F,
    ) -> Result<ProcessingResult<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let timeout = self.config.effective_timeout(requested);

        // 1. Fast path for retries of finished work.
        if let Some(state) = self.store.get_state(webhook_id).await? {
            if let Some(cached) = terminal_outcome(&state, started) {
                debug!(status = %state.status, "duplicate delivery of finished webhook");
                return cached;
            }
        }

        // 2. Reservation decides who creates the record.
        match self.store.reserve(webhook_id, timeout).await? {
            Reservation::Reserved => debug!(?timeout, "reserved new webhook"),
            Reservation::Existing(state) => {
                if let Some(cached) = terminal_outcome(&state, started) {
                    debug!(status = %state.status, "webhook finished before reservation");
                    return cached;
                }
                debug!(status = %state.status, "webhook already reserved, competing for lock");
            }
        }

        // 3. The lock decides who executes.
        let Some(handle) = self.lock.try_lock(webhook_id, timeout).await? else {
            return self.contended(webhook_id, started).await;
        };
        let lock = LockGuard::new(webhook_id, handle);
        debug!("lock acquired");

        let outcome = self.execute_locked(webhook_id, handler, started).await;

        // 7.
        lock.release().await;
        outcome
    }

    async fn execute_locked<T, F, Fut>(
        &self,
        webhook_id: &str,
        handler: F,
        started: Instant,
    ) -> Result<ProcessingResult<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        // A previous holder may have finished, or died, between our
        // reservation and our lock.
        if let Some(state) = self.store.get_state(webhook_id).await? {
            if let Some(cached) = terminal_outcome(&state, started) {
                debug!(status = %state.status, "webhook finished while waiting for lock");
                return cached;
            }
            if state.status == WebhookStatus::Processing {
                warn!(
                    reserved_until = %state.reserved_until,
                    updated_at = %state.updated_at,
                    "webhook stuck in PROCESSING with no lock holder; leaving for recovery"
                );
                return Ok(open_failure(ABANDONED_MESSAGE, started));
            }
        }

        // 4. Crash-safety boundary.
        self.store.mark_processing(webhook_id).await?;

        // 5.
        let caught = AssertUnwindSafe(async move { handler().await })
            .catch_unwind()
            .await;
        let outcome = match caught {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(panic) => Err(panic_message(panic)),
        };

        // 6.
        match outcome {
            Ok(output) => {
                let value = match serde_json::to_value(&output) {
                    Ok(value) => value,
                    Err(source) => {
                        let message = format!("handler output could not be stored: {source}");
                        self.store.mark_failed(webhook_id, &message).await?;
                        return Err(GuardError::Payload {
                            webhook_id: webhook_id.to_string(),
                            source,
                        });
                    }
                };
                self.store.mark_complete(webhook_id, value).await?;

                let duration_ms = elapsed_ms(started);
                info!(duration_ms, "webhook handler completed");
                Ok(ProcessingResult {
                    success: true,
                    output: Some(output),
                    error: None,
                    duration_ms,
                    cached: false,
                })
            }
            Err(message) => {
                self.store.mark_failed(webhook_id, &message).await?;

                let duration_ms = elapsed_ms(started);
                info!(duration_ms, error = %message, "webhook handler failed");
                Ok(ProcessingResult {
                    success: false,
                    output: None,
                    error: Some(message),
                    duration_ms,
                    cached: false,
                })
            }
        }
    }

    /// Another worker holds the lock: wait once, look once.
    async fn contended<T>(&self, webhook_id: &str, started: Instant) -> Result<ProcessingResult<T>>
    where
        T: DeserializeOwned,
    {
        debug!(wait = ?self.config.contention_wait, "lock held elsewhere");
        tokio::time::sleep(self.config.contention_wait).await;

        if let Some(state) = self.store.get_state(webhook_id).await? {
            if let Some(cached) = terminal_outcome(&state, started) {
                debug!(status = %state.status, "concurrent delivery finished during wait");
                return cached;
            }
        }

        warn!("webhook still in flight after contention wait");
        Ok(open_failure(CONTENDED_MESSAGE, started))
    }
}

/// Builder for [`WebhookGuard`].
pub struct WebhookGuardBuilder {
    store: Arc<dyn WebhookStore>,
    lock: Arc<dyn DistributedLock>,
    config: GuardConfig,
}

impl WebhookGuardBuilder {
    pub fn config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn contention_wait(mut self, wait: Duration) -> Self {
        self.config.contention_wait = wait;
        self
    }

    pub fn build(self) -> WebhookGuard {
        WebhookGuard {
            store: self.store,
            lock: self.lock,
            config: self.config,
        }
    }
}

/// Cached result for a terminal record, `None` for an open one.
fn terminal_outcome<T: DeserializeOwned>(
    state: &WebhookState,
    started: Instant,
) -> Option<Result<ProcessingResult<T>>> {
    match state.status {
        WebhookStatus::Complete => {
            let decoded = state
                .result
                .clone()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|source| GuardError::Payload {
                    webhook_id: state.webhook_id.clone(),
                    source,
                });
            Some(decoded.map(|output| ProcessingResult {
                success: true,
                output,
                error: None,
                duration_ms: elapsed_ms(started),
                cached: true,
            }))
        }
        WebhookStatus::Failed => Some(Ok(ProcessingResult {
            success: false,
            output: None,
            error: Some(state.error.clone().unwrap_or_else(|| UNKNOWN_ERROR.to_string())),
            duration_ms: elapsed_ms(started),
            cached: true,
        })),
        WebhookStatus::Pending | WebhookStatus::Processing => None,
    }
}

fn open_failure<T>(message: &str, started: Instant) -> ProcessingResult<T> {
    ProcessingResult {
        success: false,
        output: None,
        error: Some(message.to_string()),
        duration_ms: elapsed_ms(started),
        cached: false,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match detail {
        Some(detail) => format!("handler panicked: {detail}"),
        None => "handler panicked".to_string(),
    }
}
