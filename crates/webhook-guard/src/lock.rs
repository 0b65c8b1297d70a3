//! Distributed mutual exclusion, one lock per webhook id.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

/// An acquired lock.
#[async_trait]
pub trait LockHandle: Send {
    /// Give the lock back.
    ///
    /// May fail if the backend session is already gone; the backend's lease
    /// expiry releases the key in that case, so callers treat failure as
    /// non-fatal.
    async fn release(self: Box<Self>) -> anyhow::Result<()>;
}

/// Lock backend contract.
///
/// Implementations must never block waiting for a holder, must scope locks per
/// key, and must expire a lock on their own after `timeout` so a crashed
/// holder cannot wedge a key.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// One bounded attempt. `Ok(None)` means someone else holds `key`.
    async fn try_lock(&self, key: &str, timeout: Duration) -> anyhow::Result<Option<Box<dyn LockHandle>>>;
}

/// Scoped ownership of a [`LockHandle`].
///
/// Call [`LockGuard::release`] on the normal path. If the guard is dropped
/// while still holding (panic unwinding, a cancelled future) the release is
/// handed to the current tokio runtime; without a runtime the lease simply
/// expires.
pub struct LockGuard {
    key: String,
    handle: Option<Box<dyn LockHandle>>,
}

impl LockGuard {
    pub fn new(key: impl Into<String>, handle: Box<dyn LockHandle>) -> Self {
        Self {
            key: key.into(),
            handle: Some(handle),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release now, logging and swallowing any failure.
    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            release_quietly(&self.key, handle).await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { release_quietly(&key, handle).await });
            }
            Err(_) => {
                warn!(webhook_id = %key, "lock dropped outside a runtime; relying on lease expiry");
            }
        }
    }
}

async fn release_quietly(key: &str, handle: Box<dyn LockHandle>) {
    if let Err(e) = handle.release().await {
        warn!(webhook_id = %key, error = %e, "lock release failed; lease expiry will free it");
    }
}
