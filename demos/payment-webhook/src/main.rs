//! # Payment Webhook Demo
//!
//! A payment provider delivers the same `charge.succeeded` event to five
//! workers at once, then retries it twice more. The customer is credited once.
//!
//! Run with `RUST_LOG=debug` to watch the guard's decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use webhook_guard_core::{InMemoryLock, InMemoryStore, WebhookGuard, WebhookStore};

// ============================================================================
// Domain
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Credit {
    ledger_entry: u64,
    amount_cents: u64,
}

/// The side effect we must not repeat.
#[derive(Default)]
struct Ledger {
    next_entry: AtomicU64,
    balance_cents: AtomicU64,
}

impl Ledger {
    async fn credit(&self, amount_cents: u64) -> Result<Credit> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ledger_entry = self.next_entry.fetch_add(1, Ordering::SeqCst) + 1;
        self.balance_cents.fetch_add(amount_cents, Ordering::SeqCst);
        Ok(Credit {
            ledger_entry,
            amount_cents,
        })
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let store = Arc::new(InMemoryStore::new());
    let guard = WebhookGuard::builder(store.clone(), Arc::new(InMemoryLock::new()))
        .default_timeout(Duration::from_secs(30))
        .contention_wait(Duration::from_millis(250))
        .build();
    let ledger = Arc::new(Ledger::default());

    let event_id = "evt_charge_succeeded_0001";

    println!("Delivering {event_id} to 5 workers concurrently...");
    let mut workers = Vec::new();
    for worker in 0..5 {
        let guard = guard.clone();
        let ledger = Arc::clone(&ledger);
        workers.push(tokio::spawn(async move {
            let result = guard
                .process(event_id, || async move { ledger.credit(2_500).await })
                .await?;
            anyhow::Ok((worker, result))
        }));
    }
    for handle in workers {
        let (worker, result) = handle.await??;
        println!(
            "  worker {worker}: success={} cached={} output={:?} error={:?} ({} ms)",
            result.success, result.cached, result.output, result.error, result.duration_ms
        );
    }

    println!("Provider retries {event_id} twice...");
    for attempt in 1..=2 {
        let ledger = Arc::clone(&ledger);
        let result = guard
            .process(event_id, || async move { ledger.credit(2_500).await })
            .await?;
        println!("  retry {attempt}: cached={} output={:?}", result.cached, result.output);
    }

    let state = store.get_state(event_id).await?;
    println!(
        "Ledger balance: {} cents across {} entr(ies); record status: {:?}",
        ledger.balance_cents.load(Ordering::SeqCst),
        ledger.next_entry.load(Ordering::SeqCst),
        state.map(|s| s.status)
    );

    Ok(())
}
