//! In-process lock store.
//!
//! A single mutex over a map; every operation is one short critical section
//! with no awaits inside, so check-and-set is atomic. Uses `tokio::time`
//! so tests can drive expiry with a paused clock.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{LockEntry, LockStore};
use crate::error::Result;

#[derive(Debug)]
struct Slot {
    value: String,
    expires_at: Instant,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn set_if_absent_or_expired(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        if slots.get(key).is_some_and(|s| s.is_live(now)) {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        self.slots.lock().await.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .slots
            .lock()
            .await
            .get(key)
            .filter(|s| s.is_live(now))
            .map(|s| s.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .slots
            .lock()
            .await
            .remove(key)
            .is_some_and(|s| s.is_live(now)))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<LockEntry>> {
        let now = Instant::now();
        let slots = self.slots.lock().await;
        let mut entries: Vec<LockEntry> = slots
            .iter()
            .filter(|(k, s)| k.starts_with(prefix) && s.is_live(now))
            .map(|(k, s)| LockEntry {
                key: k.clone(),
                value: s.value.clone(),
                remaining: s.expires_at - now,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, s| s.is_live(now));
        Ok((before - slots.len()) as u64)
    }
}
