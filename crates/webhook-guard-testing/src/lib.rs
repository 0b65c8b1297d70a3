//! Test doubles for webhook-guard.
//!
//! - [`FlakyStore`] wraps any store and fails chosen operations on demand.
//! - [`ScriptedLock`] grants or denies locks according to a fixed script.
//! - [`ExecutionCounter`] counts handler runs across tasks.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use webhook_guard_core::{
    DistributedLock, GuardError, InMemoryStore, LockHandle, Reservation, Result, StatusCounts,
    WebhookState, WebhookStore,
};

/// Store operations that [`FlakyStore`] can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetState,
    Reserve,
    MarkProcessing,
    MarkComplete,
    MarkFailed,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOp::GetState => "get_state",
            StoreOp::Reserve => "reserve",
            StoreOp::MarkProcessing => "mark_processing",
            StoreOp::MarkComplete => "mark_complete",
            StoreOp::MarkFailed => "mark_failed",
        };
        f.write_str(name)
    }
}

/// Delegating store that injects backend failures.
pub struct FlakyStore {
    inner: Arc<dyn WebhookStore>,
    failing: DashSet<StoreOp>,
    calls: DashMap<StoreOp, usize>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn WebhookStore>) -> Self {
        Self {
            inner,
            failing: DashSet::new(),
            calls: DashMap::new(),
        }
    }

    /// Wrap a fresh [`InMemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()))
    }

    /// Make every future call to `op` fail with a backend error.
    pub fn fail_on(self, op: StoreOp) -> Self {
        self.failing.insert(op);
        self
    }

    pub fn heal(&self, op: StoreOp) {
        self.failing.remove(&op);
    }

    /// How many times `op` was called, including failed calls.
    pub fn calls(&self, op: StoreOp) -> usize {
        self.calls.get(&op).map(|count| *count).unwrap_or(0)
    }

    pub fn inner(&self) -> &Arc<dyn WebhookStore> {
        &self.inner
    }

    fn enter(&self, op: StoreOp) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        if self.failing.contains(&op) {
            return Err(GuardError::Backend(anyhow::anyhow!("injected {op} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookStore for FlakyStore {
    async fn get_state(&self, webhook_id: &str) -> Result<Option<WebhookState>> {
        self.enter(StoreOp::GetState)?;
        self.inner.get_state(webhook_id).await
    }

    async fn reserve(&self, webhook_id: &str, timeout: Duration) -> Result<Reservation> {
        self.enter(StoreOp::Reserve)?;
        self.inner.reserve(webhook_id, timeout).await
    }

    async fn mark_processing(&self, webhook_id: &str) -> Result<()> {
        self.enter(StoreOp::MarkProcessing)?;
        self.inner.mark_processing(webhook_id).await
    }

    async fn mark_complete(&self, webhook_id: &str, result: serde_json::Value) -> Result<()> {
        self.enter(StoreOp::MarkComplete)?;
        self.inner.mark_complete(webhook_id, result).await
    }

    async fn mark_failed(&self, webhook_id: &str, error: &str) -> Result<()> {
        self.enter(StoreOp::MarkFailed)?;
        self.inner.mark_failed(webhook_id, error).await
    }

    async fn stale_processing(&self, now: DateTime<Utc>) -> Result<Vec<WebhookState>> {
        self.inner.stale_processing(now).await
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        self.inner.status_counts().await
    }
}

/// What a [`ScriptedLock`] does on every `try_lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScript {
    /// Always grant; release succeeds.
    Grant,
    /// Always report the key as held elsewhere.
    Deny,
    /// Always grant; release fails as if the session had dropped.
    GrantFailingRelease,
    /// The backend itself is unreachable.
    Unavailable,
}

/// Lock double with a fixed behavior and call accounting.
pub struct ScriptedLock {
    script: LockScript,
    attempts: AtomicUsize,
    released: Arc<AtomicUsize>,
    outstanding: Arc<AtomicUsize>,
}

impl ScriptedLock {
    pub fn new(script: LockScript) -> Self {
        Self {
            script,
            attempts: AtomicUsize::new(0),
            released: Arc::new(AtomicUsize::new(0)),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn granting() -> Self {
        Self::new(LockScript::Grant)
    }

    pub fn denying() -> Self {
        Self::new(LockScript::Deny)
    }

    pub fn failing_release() -> Self {
        Self::new(LockScript::GrantFailingRelease)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Release calls made, successful or not.
    pub fn release_calls(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Handles granted and not yet given back.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DistributedLock for ScriptedLock {
    async fn try_lock(&self, _key: &str, _timeout: Duration) -> anyhow::Result<Option<Box<dyn LockHandle>>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script {
            LockScript::Deny => return Ok(None),
            LockScript::Unavailable => anyhow::bail!("lock backend unreachable"),
            LockScript::Grant | LockScript::GrantFailingRelease => {}
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(ScriptedHandle {
            fail: self.script == LockScript::GrantFailingRelease,
            released: Arc::clone(&self.released),
            outstanding: Arc::clone(&self.outstanding),
        })))
    }
}

struct ScriptedHandle {
    fail: bool,
    released: Arc<AtomicUsize>,
    outstanding: Arc<AtomicUsize>,
}

#[async_trait]
impl LockHandle for ScriptedHandle {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("lock session already closed");
        }
        Ok(())
    }
}

/// Shared counter for handler executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionCounter(Arc<AtomicUsize>);

impl ExecutionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one execution and return its 1-based ordinal.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}
