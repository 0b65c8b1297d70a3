//! PostgreSQL adapters for webhook-guard.
//!
//! This crate provides production implementations of the two backend
//! contracts from `webhook-guard-core`:
//!
//! - [`PgWebhookStore`] - `WebhookStore` on a table with a primary key on the
//!   webhook id and status-guarded `UPDATE`s
//! - [`PgLeaseLock`] - `DistributedLock` on a lease table; an expired lease is
//!   taken over by the next caller, so crashed holders free their key on their
//!   own
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE webhook_states (
//!     webhook_id TEXT PRIMARY KEY,
//!     status TEXT NOT NULL
//!         CHECK (status IN ('PENDING', 'PROCESSING', 'COMPLETE', 'FAILED')),
//!     reserved_until TIMESTAMPTZ NOT NULL,
//!     result JSONB,
//!     error TEXT,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_webhook_states_stale ON webhook_states (reserved_until)
//!     WHERE status = 'PROCESSING';
//!
//! CREATE TABLE webhook_locks (
//!     lock_key TEXT PRIMARY KEY,
//!     holder UUID NOT NULL,
//!     expires_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! The full migration, including the payload constraints, is [`SCHEMA`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sqlx::PgPool;
//! use webhook_guard_core::WebhookGuard;
//! use webhook_guard_postgres::{PgLeaseLock, PgWebhookStore};
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let store = PgWebhookStore::new(pool.clone());
//! store.ensure_schema().await?;
//!
//! let guard = WebhookGuard::new(Arc::new(store), Arc::new(PgLeaseLock::new(pool)));
//! ```

mod lock;
mod store;

pub use lock::PgLeaseLock;
pub use store::PgWebhookStore;

/// Migration creating both tables. Idempotent.
pub const SCHEMA: &str = include_str!("../migrations/0001_webhook_guard.sql");
