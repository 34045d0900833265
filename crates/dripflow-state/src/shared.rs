//! Key/value coordination primitives: set-if-absent with expiry,
//! compare-and-delete, counters with TTL, capped recent logs.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use dripflow_core::Result;

const LOG_CAP: usize = 1000;

/// Contract for the fast shared state.
#[async_trait]
pub trait SharedState: Send + Sync {
    /// Set `key` only if absent, with a TTL. Returns true when the
    /// key was set (the caller "won").
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Get the current value, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Unconditional set with TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete `key` only if its value equals `expected`. Returns true
    /// when deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Refresh the TTL of `key`. Returns false when the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Atomically increment a counter. The TTL is applied when the
    /// counter is created. Returns the new value.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Remove `key` unconditionally.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Append a timestamped entry to a capped per-category log.
    async fn push_log(&self, category: &str, entry: &str) -> Result<()>;

    /// Most recent entries for a category, newest first.
    async fn recent_logs(&self, category: &str, limit: usize) -> Result<Vec<String>>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

/// In-process shared state for a single dispatcher instance.
#[derive(Default)]
pub struct MemoryState {
    entries: Mutex<HashMap<String, Entry>>,
    logs: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedState for MemoryState {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(key)
            && !existing.expired()
        {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if !entry.expired() && entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let current = match entries.get(key) {
            Some(entry) if !entry.expired() => entry.value.parse::<i64>().unwrap_or(0),
            _ => 0,
        };
        let next = current + 1;
        let expires_at = if current == 0 {
            Some(Instant::now() + ttl)
        } else {
            // Keep the original window.
            entries.get(key).and_then(|e| e.expires_at)
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn push_log(&self, category: &str, entry: &str) -> Result<()> {
        let line = format!("{} {}", chrono::Utc::now().to_rfc3339(), entry);
        let mut logs = self.logs.lock().await;
        let list = logs.entry(category.to_string()).or_default();
        list.push_front(line);
        list.truncate(LOG_CAP);
        Ok(())
    }

    async fn recent_logs(&self, category: &str, limit: usize) -> Result<Vec<String>> {
        let logs = self.logs.lock().await;
        Ok(logs
            .get(category)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
