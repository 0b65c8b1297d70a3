use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use webhook_guard_core::{
    reservation_deadline, GuardError, Reservation, Result, StatusCounts, Transition, WebhookState, WebhookStatus,
    WebhookStore,
};

use crate::SCHEMA;

/// PostgreSQL webhook state store.
///
/// Reservation relies on the primary key (`INSERT ... ON CONFLICT DO
/// NOTHING`); transitions are `UPDATE`s conditioned on the expected current
/// status, so two writers can never both move the same record.
#[derive(Clone)]
pub struct PgWebhookStore {
    pool: PgPool,
}

impl PgWebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they are missing.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("applying webhook-guard schema")?;
        Ok(())
    }

    async fn transition(&self, webhook_id: &str, transition: Transition) -> Result<()> {
        let to = transition.target();
        let Some(from) = to.required_predecessor() else {
            return Err(GuardError::InvalidTransition {
                webhook_id: webhook_id.to_string(),
                from: None,
                to,
            });
        };
        let (result, error) = match transition {
            Transition::Processing => (None, None),
            Transition::Complete(value) => (Some(value), None),
            Transition::Failed(message) => (None, Some(message)),
        };

        let updated = sqlx::query(
            r#"
            UPDATE webhook_states
            SET status = $1,
                result = $2,
                error = $3,
                updated_at = $4
            WHERE webhook_id = $5
              AND status = $6
            "#,
        )
        .bind(to.as_str())
        .bind(result)
        .bind(error)
        .bind(Utc::now())
        .bind(webhook_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("moving webhook {webhook_id} to {to}"))?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }

        let current = self.get_state(webhook_id).await?.map(|state| state.status);
        Err(GuardError::InvalidTransition {
            webhook_id: webhook_id.to_string(),
            from: current,
            to,
        })
    }
}

#[async_trait]
impl WebhookStore for PgWebhookStore {
    async fn get_state(&self, webhook_id: &str) -> Result<Option<WebhookState>> {
        let row = sqlx::query(
            r#"
            SELECT webhook_id, status, reserved_until, result, error, created_at, updated_at
            FROM webhook_states
            WHERE webhook_id = $1
            "#,
        )
        .bind(webhook_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("reading webhook {webhook_id}"))?;

        Ok(row.as_ref().map(state_from_row).transpose()?)
    }

    /// Insert-or-nothing on the primary key.
    async fn reserve(&self, webhook_id: &str, timeout: Duration) -> Result<Reservation> {
        let now = Utc::now();
        let reserved_until = reservation_deadline(now, timeout)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO webhook_states
                (webhook_id, status, reserved_until, created_at, updated_at)
            VALUES ($1, 'PENDING', $2, $3, $3)
            ON CONFLICT (webhook_id) DO NOTHING
            RETURNING webhook_id
            "#,
        )
        .bind(webhook_id)
        .bind(reserved_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("reserving webhook {webhook_id}"))?;

        if inserted.is_some() {
            debug!(webhook_id, %reserved_until, "reservation row inserted");
            return Ok(Reservation::Reserved);
        }

        match self.get_state(webhook_id).await? {
            Some(existing) => Ok(Reservation::Existing(existing)),
            None => Err(anyhow::anyhow!(
                "webhook {webhook_id} conflicted on insert but is no longer present"
            )
            .into()),
        }
    }

    async fn mark_processing(&self, webhook_id: &str) -> Result<()> {
        self.transition(webhook_id, Transition::Processing).await
    }

    async fn mark_complete(&self, webhook_id: &str, result: serde_json::Value) -> Result<()> {
        self.transition(webhook_id, Transition::Complete(result)).await
    }

    async fn mark_failed(&self, webhook_id: &str, error: &str) -> Result<()> {
        self.transition(webhook_id, Transition::Failed(error.to_string())).await
    }

    async fn stale_processing(&self, now: DateTime<Utc>) -> Result<Vec<WebhookState>> {
        let rows = sqlx::query(
            r#"
            SELECT webhook_id, status, reserved_until, result, error, created_at, updated_at
            FROM webhook_states
            WHERE status = 'PROCESSING'
              AND reserved_until < $1
            ORDER BY reserved_until ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("listing stale PROCESSING webhooks")?;

        Ok(rows.iter().map(state_from_row).collect::<anyhow::Result<_>>()?)
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'PENDING') as pending,
                COUNT(*) FILTER (WHERE status = 'PROCESSING') as processing,
                COUNT(*) FILTER (WHERE status = 'COMPLETE') as complete,
                COUNT(*) FILTER (WHERE status = 'FAILED') as failed
            FROM webhook_states
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("counting webhook states")?;

        Ok(StatusCounts {
            pending: row.try_get("pending").context("pending count")?,
            processing: row.try_get("processing").context("processing count")?,
            complete: row.try_get("complete").context("complete count")?,
            failed: row.try_get("failed").context("failed count")?,
        })
    }
}

fn state_from_row(row: &PgRow) -> anyhow::Result<WebhookState> {
    let status: String = row.try_get("status")?;
    Ok(WebhookState {
        webhook_id: row.try_get("webhook_id")?,
        status: status.parse::<WebhookStatus>()?,
        reserved_until: row.try_get("reserved_until")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
