//! # Webhook Guard
//!
//! Runs the work attached to a webhook **at most once**, no matter how many
//! times the webhook is delivered or how many workers receive it at the same
//! time. A crash in the middle of execution leaves a visible `PROCESSING`
//! record instead of a silent gap or a double effect.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!   │ process(id, handler)
//!   ▼
//! WebhookGuard ──► WebhookStore      get_state / reserve / mark_*
//!   │          └─► DistributedLock   try_lock / release
//!   ▼
//! handler() ──► ProcessingResult { success, output, error, duration_ms, cached }
//! ```
//!
//! The store's atomic [`reserve`](WebhookStore::reserve) settles who creates a
//! record; the lock settles who runs the handler for a record that already
//! exists. Neither is enough on its own.
//!
//! ## Key Invariants
//!
//! 1. **One record per id** - created only by a successful reservation
//! 2. **Guarded transitions** - `PENDING -> PROCESSING -> COMPLETE | FAILED`, enforced by the store
//! 3. **Terminal is final** - `COMPLETE` and `FAILED` never change again
//! 4. **Stateless guard** - all coordination lives in the store and lock backends
//! 5. **Lock always released** - on every exit path, release failures swallowed
//!
//! ## What This Is Not
//!
//! - A retry or backoff policy for failing handlers
//! - A compensating-transaction framework
//! - An ordering guarantee across different webhooks
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use webhook_guard_core::{InMemoryLock, InMemoryStore, WebhookGuard};
//!
//! let guard = WebhookGuard::new(Arc::new(InMemoryStore::new()), Arc::new(InMemoryLock::new()));
//!
//! let result = guard
//!     .process("evt_1Nq8", || async { charge_card().await })
//!     .await?;
//!
//! if result.cached {
//!     // duplicate delivery, handler did not run
//! }
//! ```

mod config;
mod error;
mod guard;
mod lock;
mod memory;
mod model;
mod store;

pub use crate::config::{GuardConfig, DEFAULT_CONTENTION_WAIT, DEFAULT_TIMEOUT};
pub use crate::error::{GuardError, Result};
pub use crate::guard::{WebhookGuard, WebhookGuardBuilder, ABANDONED_MESSAGE, CONTENDED_MESSAGE};
pub use crate::lock::{DistributedLock, LockGuard, LockHandle};
pub use crate::memory::{InMemoryLock, InMemoryStore};
pub use crate::model::{
    reservation_deadline, ProcessingResult, StatusCounts, Transition, UnknownStatus, WebhookState,
    WebhookStatus,
};
pub use crate::store::{Reservation, WebhookStore};

// Re-export commonly used external types
pub use async_trait::async_trait;
