//! Asynchronous job queue used by the bulk router and worker.
//!
//! Delivery is at-least-once. A received message stays invisible for the
//! visibility window and reappears if it is not acknowledged in time, so a
//! crashed or timed-out worker never loses a job.

pub mod memory;

pub use memory::MemoryQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::OperationKind;

/// A message handed to a worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub msg_id: i64,
    /// How many times this message has been delivered, this one included.
    pub read_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    /// Execution budget the job was enqueued with.
    pub timeout: Duration,
}

/// Wire form of a queued message: the job payload plus its time budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub payload: serde_json::Value,
    pub timeout_secs: u64,
}

#[async_trait]
pub trait WorkerQueue: Send + Sync {
    /// Hand a job to the queue for `kind`. Returns the message id.
    async fn enqueue(
        &self,
        kind: OperationKind,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<i64>;

    /// Take the next visible message, hiding it for `visibility`.
    async fn receive(&self, kind: OperationKind, visibility: Duration) -> Result<Option<QueuedJob>>;

    /// Remove a message for good.
    async fn ack(&self, kind: OperationKind, msg_id: i64) -> Result<()>;
}
