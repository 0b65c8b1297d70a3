//! Contention, abandoned records, and faults from the handler or backends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use webhook_guard_core::{
    GuardError, InMemoryLock, InMemoryStore, ProcessingResult, Reservation, StatusCounts, WebhookGuard,
    WebhookState, WebhookStatus, WebhookStore, ABANDONED_MESSAGE, CONTENDED_MESSAGE,
};
use webhook_guard_testing::{ExecutionCounter, FlakyStore, LockScript, ScriptedLock, StoreOp};

const WAIT: Duration = Duration::from_millis(50);

fn guard_with(store: Arc<dyn WebhookStore>, lock: Arc<ScriptedLock>) -> WebhookGuard {
    WebhookGuard::builder(store, lock).contention_wait(WAIT).build()
}

#[tokio::test]
async fn contention_returns_in_flight_failure_after_bounded_wait() {
    let store = Arc::new(InMemoryStore::new());
    store.reserve("busy", Duration::from_secs(60)).await.unwrap();
    let lock = Arc::new(ScriptedLock::denying());
    let guard = guard_with(store.clone(), lock.clone());
    let counter = ExecutionCounter::new();

    let started = Instant::now();
    let handler_counter = counter.clone();
    let result = guard
        .process("busy", || async move { Ok(handler_counter.hit()) })
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(!result.success);
    assert!(!result.cached);
    assert_eq!(result.error.as_deref(), Some(CONTENDED_MESSAGE));
    assert!(result.output.is_none());
    assert!(result.duration_ms >= WAIT.as_millis() as u64);
    assert!(elapsed >= WAIT);
    assert!(elapsed < Duration::from_secs(2));

    assert_eq!(counter.count(), 0);
    assert_eq!(lock.attempts(), 1);
    assert_eq!(
        store.get_state("busy").await.unwrap().unwrap().status,
        WebhookStatus::Pending
    );
}

#[tokio::test]
async fn contention_recheck_picks_up_finished_result() {
    let store = Arc::new(InMemoryStore::new());
    store.reserve("racing", Duration::from_secs(60)).await.unwrap();
    store.mark_processing("racing").await.unwrap();

    let finisher = {
        let store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            store.mark_complete("racing", json!({"receipt": "R-1"})).await
        })
    };

    let guard = guard_with(store.clone(), Arc::new(ScriptedLock::denying()));
    let result = guard
        .process("racing", || async { Ok(json!({"receipt": "R-2"})) })
        .await
        .unwrap();
    finisher.await.unwrap().unwrap();

    assert!(result.success);
    assert!(result.cached);
    assert_eq!(result.output, Some(json!({"receipt": "R-1"})));
}

#[tokio::test]
async fn terminal_record_short_circuits_without_lock() {
    let store = Arc::new(InMemoryStore::new());
    store.reserve("done", Duration::from_secs(60)).await.unwrap();
    store.mark_processing("done").await.unwrap();
    store.mark_failed("done", "upstream rejected").await.unwrap();

    let lock = Arc::new(ScriptedLock::granting());
    let guard = guard_with(store, lock.clone());
    let result: ProcessingResult<()> = guard.process("done", || async { Ok(()) }).await.unwrap();

    assert!(result.cached);
    assert_eq!(result.error.as_deref(), Some("upstream rejected"));
    assert_eq!(lock.attempts(), 0);
}

#[tokio::test]
async fn failed_record_without_error_text_reports_unknown() {
    let store = Arc::new(InMemoryStore::new());
    let now = Utc::now();
    store.insert_raw(WebhookState {
        webhook_id: "legacy".into(),
        status: WebhookStatus::Failed,
        reserved_until: now,
        result: None,
        error: None,
        created_at: now,
        updated_at: now,
    });

    let guard = guard_with(store, Arc::new(ScriptedLock::granting()));
    let result: ProcessingResult<()> = guard.process("legacy", || async { Ok(()) }).await.unwrap();

    assert!(result.cached);
    assert_eq!(result.error.as_deref(), Some("Unknown error"));
}

#[tokio::test]
async fn abandoned_processing_record_is_not_rerun() {
    let store = Arc::new(InMemoryStore::new());
    store.reserve("orphan", Duration::from_millis(1)).await.unwrap();
    store.mark_processing("orphan").await.unwrap();

    let lock = Arc::new(ScriptedLock::granting());
    let guard = guard_with(store.clone(), lock.clone());
    let counter = ExecutionCounter::new();
    let handler_counter = counter.clone();

    let result = guard
        .process("orphan", || async move { Ok(handler_counter.hit()) })
        .await
        .unwrap();

    assert!(!result.success);
    assert!(!result.cached);
    assert_eq!(result.error.as_deref(), Some(ABANDONED_MESSAGE));
    assert_eq!(counter.count(), 0);
    assert_eq!(lock.outstanding(), 0);

    let stale = store
        .stale_processing(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].webhook_id, "orphan");
}

#[tokio::test]
async fn lock_released_after_handler_failure() {
    let lock = Arc::new(ScriptedLock::granting());
    let guard = guard_with(Arc::new(InMemoryStore::new()), lock.clone());

    let result: ProcessingResult<()> = guard
        .process("faulty", || async { Err(anyhow::anyhow!("boom")) })
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(lock.release_calls(), 1);
    assert_eq!(lock.outstanding(), 0);
}

#[tokio::test]
async fn lock_released_when_store_write_fails() {
    let store = Arc::new(FlakyStore::in_memory().fail_on(StoreOp::MarkComplete));
    let lock = Arc::new(ScriptedLock::granting());
    let guard = guard_with(store.clone(), lock.clone());

    let err = guard
        .process("half-written", || async { Ok(5) })
        .await
        .unwrap_err();

    assert!(matches!(err, GuardError::Backend(_)));
    assert_eq!(lock.release_calls(), 1);
    assert_eq!(lock.outstanding(), 0);

    // The crash-safety boundary was crossed, so the record is visibly stuck.
    let state = store.inner().get_state("half-written").await.unwrap().unwrap();
    assert_eq!(state.status, WebhookStatus::Processing);
}

#[tokio::test]
async fn cancelled_delivery_still_releases_lock() {
    let store = Arc::new(InMemoryStore::new());
    let lock = Arc::new(InMemoryLock::new());
    let guard = WebhookGuard::builder(store.clone(), lock.clone())
        .contention_wait(WAIT)
        .build();

    let worker = {
        let guard = guard.clone();
        tokio::spawn(async move {
            guard
                .process("slow", || async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(1)
                })
                .await
        })
    };

    for _ in 0..100 {
        if lock.is_held("slow") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(lock.is_held("slow"));

    worker.abort();
    assert!(worker.await.unwrap_err().is_cancelled());

    for _ in 0..100 {
        if !lock.is_held("slow") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!lock.is_held("slow"));
    assert_eq!(lock.releases(), 1);

    // Execution had started, so the record is left for recovery.
    assert_eq!(
        store.get_state("slow").await.unwrap().unwrap().status,
        WebhookStatus::Processing
    );
}

#[tokio::test]
async fn release_failure_is_swallowed() {
    let lock = Arc::new(ScriptedLock::failing_release());
    let guard = guard_with(Arc::new(InMemoryStore::new()), lock.clone());

    let result = guard.process("sticky", || async { Ok("ok".to_string()) }).await.unwrap();

    assert!(result.success);
    assert_eq!(result.output, Some("ok".to_string()));
    assert_eq!(lock.release_calls(), 1);
}

#[tokio::test]
async fn lock_backend_outage_propagates() {
    let store = Arc::new(InMemoryStore::new());
    let guard = guard_with(store.clone(), Arc::new(ScriptedLock::new(LockScript::Unavailable)));

    let err = guard.process("offline", || async { Ok(1) }).await.unwrap_err();

    assert!(matches!(err, GuardError::Backend(_)));
    assert_eq!(err.to_string(), "lock backend unreachable");
    assert_eq!(
        store.get_state("offline").await.unwrap().unwrap().status,
        WebhookStatus::Pending
    );
}

/// Claims every reservation but never writes anything: a backend without the
/// atomicity the contract requires.
struct ForgetfulStore;

#[async_trait]
impl WebhookStore for ForgetfulStore {
    async fn get_state(&self, _webhook_id: &str) -> webhook_guard_core::Result<Option<WebhookState>> {
        Ok(None)
    }

    async fn reserve(&self, _webhook_id: &str, _timeout: Duration) -> webhook_guard_core::Result<Reservation> {
        Ok(Reservation::Reserved)
    }

    async fn mark_processing(&self, webhook_id: &str) -> webhook_guard_core::Result<()> {
        Err(GuardError::InvalidTransition {
            webhook_id: webhook_id.to_string(),
            from: None,
            to: WebhookStatus::Processing,
        })
    }

    async fn mark_complete(&self, webhook_id: &str, _result: serde_json::Value) -> webhook_guard_core::Result<()> {
        Err(GuardError::InvalidTransition {
            webhook_id: webhook_id.to_string(),
            from: None,
            to: WebhookStatus::Complete,
        })
    }

    async fn mark_failed(&self, webhook_id: &str, _error: &str) -> webhook_guard_core::Result<()> {
        Err(GuardError::InvalidTransition {
            webhook_id: webhook_id.to_string(),
            from: None,
            to: WebhookStatus::Failed,
        })
    }

    async fn stale_processing(&self, _now: DateTime<Utc>) -> webhook_guard_core::Result<Vec<WebhookState>> {
        Ok(Vec::new())
    }

    async fn status_counts(&self) -> webhook_guard_core::Result<StatusCounts> {
        Ok(StatusCounts::default())
    }
}

#[tokio::test]
async fn invalid_transition_from_backend_propagates() {
    let lock = Arc::new(ScriptedLock::granting());
    let guard = guard_with(Arc::new(ForgetfulStore), lock.clone());
    let counter = ExecutionCounter::new();
    let handler_counter = counter.clone();

    let err = guard
        .process("lost", || async move { Ok(handler_counter.hit()) })
        .await
        .unwrap_err();

    assert!(err.is_invalid_transition());
    assert_eq!(counter.count(), 0);
    assert_eq!(lock.outstanding(), 0);
}
