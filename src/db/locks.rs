//! Lock store on an UNLOGGED Postgres table.
//!
//! Expiry is evaluated against the database clock, so every process agrees
//! on when a reservation ends. The conditional upsert is a single statement
//! and therefore atomic under concurrent callers.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::lock::{LockEntry, LockStore};

/// Store failures are unavailability from the guard's point of view.
fn unavailable(e: sqlx::Error) -> Error {
    Error::LockStore(e.to_string())
}

#[async_trait]
impl LockStore for super::Db {
    async fn set_if_absent_or_expired(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "INSERT INTO lock_store (key, value, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (key) DO UPDATE
                 SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
                 WHERE lock_store.expires_at <= now()
             RETURNING key",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        sqlx::query(
            "INSERT INTO lock_store (key, value, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (key) DO UPDATE
                 SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM lock_store WHERE key = $1 AND expires_at > now()")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        Ok(row.map(|(v,)| v))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "DELETE FROM lock_store WHERE key = $1 RETURNING expires_at > now()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(row.is_some_and(|(live,)| live))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<LockEntry>> {
        let rows: Vec<(String, String, f64)> = sqlx::query_as(
            "SELECT key, value, EXTRACT(EPOCH FROM expires_at - now())::float8
             FROM lock_store
             WHERE starts_with(key, $1) AND expires_at > now()
             ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(rows
            .into_iter()
            .map(|(key, value, secs)| LockEntry {
                key,
                value,
                remaining: Duration::from_secs_f64(secs.max(0.0)),
            })
            .collect())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM lock_store WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?
            .rows_affected();
        Ok(purged)
    }
}
