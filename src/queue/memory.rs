//! In-process queue with visibility timeouts, for tests and local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{QueuedJob, WorkerQueue};
use crate::error::{Error, Result};
use crate::model::OperationKind;

struct Message {
    msg_id: i64,
    read_count: u32,
    enqueued_at: DateTime<Utc>,
    visible_at: Instant,
    payload: serde_json::Value,
    timeout: Duration,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<OperationKind, Vec<Message>>,
    next_id: i64,
}

#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every enqueue fail, as a broker outage would.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Messages still in the queue for `kind`, visible or not.
    pub async fn len(&self, kind: OperationKind) -> usize {
        self.inner.lock().await.queues.get(&kind).map_or(0, Vec::len)
    }

    /// Payloads still in the queue for `kind`, oldest first.
    pub async fn payloads(&self, kind: OperationKind) -> Vec<serde_json::Value> {
        self.inner
            .lock()
            .await
            .queues
            .get(&kind)
            .map(|q| q.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkerQueue for MemoryQueue {
    async fn enqueue(
        &self,
        kind: OperationKind,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<i64> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Enqueue(format!("queue {} unavailable", kind.queue_name())));
        }
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let msg_id = inner.next_id;
        inner.queues.entry(kind).or_default().push(Message {
            msg_id,
            read_count: 0,
            enqueued_at: Utc::now(),
            visible_at: Instant::now(),
            payload: payload.clone(),
            timeout,
        });
        Ok(msg_id)
    }

    async fn receive(
        &self,
        kind: OperationKind,
        visibility: Duration,
    ) -> Result<Option<QueuedJob>> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let Some(queue) = inner.queues.get_mut(&kind) else {
            return Ok(None);
        };
        let Some(msg) = queue.iter_mut().find(|m| m.visible_at <= now) else {
            return Ok(None);
        };
        msg.read_count += 1;
        msg.visible_at = now + visibility;
        Ok(Some(QueuedJob {
            msg_id: msg.msg_id,
            read_count: msg.read_count,
            enqueued_at: msg.enqueued_at,
            payload: msg.payload.clone(),
            timeout: msg.timeout,
        }))
    }

    async fn ack(&self, kind: OperationKind, msg_id: i64) -> Result<()> {
        if let Some(queue) = self.inner.lock().await.queues.get_mut(&kind) {
            queue.retain(|m| m.msg_id != msg_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn unacked_message_reappears_after_visibility() {
        let q = MemoryQueue::new();
        let kind = OperationKind::Delete;
        q.enqueue(kind, &json!({"n": 1}), Duration::from_secs(60)).await.unwrap();

        let first = q.receive(kind, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(first.read_count, 1);
        assert!(q.receive(kind, Duration::from_secs(5)).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = q.receive(kind, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(again.msg_id, first.msg_id);
        assert_eq!(again.read_count, 2);

        q.ack(kind, again.msg_id).await.unwrap();
        assert_eq!(q.len(kind).await, 0);
    }

    #[tokio::test]
    async fn outage_fails_enqueue() {
        let q = MemoryQueue::new();
        q.set_unavailable(true);
        let err = q
            .enqueue(OperationKind::Export, &json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
