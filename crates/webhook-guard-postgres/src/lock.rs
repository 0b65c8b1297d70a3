use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;
use webhook_guard_core::{DistributedLock, LockHandle};

/// Lease-table distributed lock.
///
/// A lease row is owned by a random holder token until `expires_at`. Expiry
/// is judged by the database clock, so workers with skewed clocks still agree.
#[derive(Clone)]
pub struct PgLeaseLock {
    pool: PgPool,
}

impl PgLeaseLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete leases that have already expired.
    ///
    /// Expired rows do not block anyone, so this is housekeeping only.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM webhook_locks WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await
            .context("purging expired webhook leases")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DistributedLock for PgLeaseLock {
    /// Insert a lease, or take over one that has expired. Never waits on a
    /// live holder.
    async fn try_lock(&self, key: &str, timeout: Duration) -> Result<Option<Box<dyn LockHandle>>> {
        let holder = Uuid::new_v4();

        let acquired = sqlx::query(
            r#"
            INSERT INTO webhook_locks (lock_key, holder, expires_at)
            VALUES ($1, $2, NOW() + ($3::double precision * INTERVAL '1 millisecond'))
            ON CONFLICT (lock_key) DO UPDATE
                SET holder = EXCLUDED.holder,
                    expires_at = EXCLUDED.expires_at
                WHERE webhook_locks.expires_at < NOW()
            RETURNING holder
            "#,
        )
        .bind(key)
        .bind(holder)
        .bind(lease_millis(timeout))
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("acquiring lease on {key}"))?;

        if acquired.is_none() {
            return Ok(None);
        }

        debug!(webhook_id = %key, %holder, "lease acquired");
        Ok(Some(Box::new(PgLeaseHandle {
            pool: self.pool.clone(),
            key: key.to_string(),
            holder,
        })))
    }
}

struct PgLeaseHandle {
    pool: PgPool,
    key: String,
    holder: Uuid,
}

#[async_trait]
impl LockHandle for PgLeaseHandle {
    async fn release(self: Box<Self>) -> Result<()> {
        let result = sqlx::query("DELETE FROM webhook_locks WHERE lock_key = $1 AND holder = $2")
            .bind(&self.key)
            .bind(self.holder)
            .execute(&self.pool)
            .await
            .with_context(|| format!("releasing lease on {}", self.key))?;

        if result.rows_affected() == 0 {
            anyhow::bail!("lease on {} expired before release", self.key);
        }
        Ok(())
    }
}

fn lease_millis(timeout: Duration) -> f64 {
    timeout.as_secs_f64() * 1000.0
}
