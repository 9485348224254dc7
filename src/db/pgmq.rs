//! Worker queue on pgmq, one queue per bulk operation kind.
//!
//! Messages carry an [`Envelope`] so the job's time budget travels with it.
//! Acknowledged messages are archived rather than deleted, which keeps an
//! audit trail of every bulk job that ran.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;

use crate::error::{Error, Result};
use crate::model::OperationKind;
use crate::queue::{Envelope, QueuedJob, WorkerQueue};
use crate::telemetry::metrics;

fn record(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// pgmq visibility timeouts are whole seconds.
fn vt_seconds(d: Duration) -> i32 {
    i32::try_from(d.as_secs().max(1)).unwrap_or(i32::MAX)
}

impl super::Db {
    /// Create every bulk queue (idempotent).
    pub async fn ensure_queues(&self) -> Result<()> {
        for kind in OperationKind::ALL {
            sqlx::query("SELECT pgmq.create($1)")
                .bind(kind.queue_name())
                .execute(&self.pool)
                .await?;
            record(kind.queue_name(), "create");
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerQueue for super::Db {
    async fn enqueue(
        &self,
        kind: OperationKind,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<i64> {
        let queue = kind.queue_name();
        let envelope = serde_json::to_value(Envelope {
            payload: payload.clone(),
            timeout_secs: timeout.as_secs(),
        })?;

        let (msg_id,): (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
            .bind(queue)
            .bind(&envelope)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Enqueue(format!("{queue}: {e}")))?;

        record(queue, "send");
        Ok(msg_id)
    }

    async fn receive(
        &self,
        kind: OperationKind,
        visibility: Duration,
    ) -> Result<Option<QueuedJob>> {
        let queue = kind.queue_name();
        let row: Option<(i64, i32, DateTime<Utc>, serde_json::Value)> = sqlx::query_as(
            "SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, 1)",
        )
        .bind(queue)
        .bind(vt_seconds(visibility))
        .fetch_optional(&self.pool)
        .await?;

        record(queue, if row.is_some() { "read" } else { "read_empty" });

        let Some((msg_id, read_ct, enqueued_at, message)) = row else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_value(message)?;
        Ok(Some(QueuedJob {
            msg_id,
            read_count: read_ct.max(0) as u32,
            enqueued_at,
            payload: envelope.payload,
            timeout: Duration::from_secs(envelope.timeout_secs),
        }))
    }

    async fn ack(&self, kind: OperationKind, msg_id: i64) -> Result<()> {
        let queue = kind.queue_name();
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        record(queue, "archive");
        Ok(())
    }
}
