//! The key-value contract and its in-memory implementation.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::StateResult;

/// A single logical database with Redis semantics.
///
/// Each call is one round trip; there are no transactions. Values written
/// by `set` lose any TTL they had, as with a plain Redis `SET`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StateResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> StateResult<()>;

    /// Creates the key only if absent. Returns true if this call created it.
    async fn set_nx(&self, key: &str, value: &str) -> StateResult<bool>;

    /// Sets or refreshes a TTL. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StateResult<bool>;

    /// Returns true if the key existed.
    async fn delete(&self, key: &str) -> StateResult<bool>;

    /// Keys starting with `prefix`. Keys may vanish before a following get.
    async fn scan_prefix(&self, prefix: &str) -> StateResult<Vec<String>>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|t| now < t)
    }
}

/// In-process store used by tests. Expired keys are dropped lazily on
/// access, using tokio's clock so paused-time tests can advance it.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, e| e.is_live(now));
        f(&mut entries)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> StateResult<Option<String>> {
        Ok(self.with_entries(|m| m.get(key).map(|e| e.value.clone())))
    }

    async fn set(&self, key: &str, value: &str) -> StateResult<()> {
        self.with_entries(|m| {
            m.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            )
        });
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> StateResult<bool> {
        Ok(self.with_entries(|m| {
            if m.contains_key(key) {
                false
            } else {
                m.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at: None,
                    },
                );
                true
            }
        }))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StateResult<bool> {
        Ok(self.with_entries(|m| match m.get_mut(key) {
            Some(e) => {
                e.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }))
    }

    async fn delete(&self, key: &str) -> StateResult<bool> {
        Ok(self.with_entries(|m| m.remove(key).is_some()))
    }

    async fn scan_prefix(&self, prefix: &str) -> StateResult<Vec<String>> {
        Ok(self.with_entries(|m| {
            m.keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect()
        }))
    }
}
