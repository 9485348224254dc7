//! Expiring key-value store used for reservations.
//!
//! The only correctness-critical primitive is
//! [`LockStore::set_if_absent_or_expired`], which must be atomic. Expired
//! entries are invisible to every read; physically removing them is
//! housekeeping only.

pub mod key;
pub mod memory;

pub use key::LockKey;
pub use memory::MemoryLockStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// A live entry returned by [`LockStore::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub key: String,
    pub value: String,
    /// Time left before the entry expires, as measured by the store.
    pub remaining: Duration,
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically set `key` unless a live entry already exists.
    /// Returns `true` if this call wrote the entry.
    async fn set_if_absent_or_expired(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Unconditionally set `key`, replacing any live entry and its TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Value of a live entry.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key`. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All live entries whose key starts with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<LockEntry>>;

    /// Physically drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}
