//! In-memory store backends
//!
//! Process-local implementations of the store traits. TTLs are enforced
//! lazily on access. Both backends expose an availability toggle so tests
//! can exercise the fail-open and fallback paths of their consumers.

use crate::{DocumentStore, KvStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use nexus_common::{ErrorCode, NexusError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

struct KvEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() > at)
    }
}

struct CounterEntry {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// In-memory [`KvStore`] with lazy TTL expiry.
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, KvEntry>>,
    counters: Mutex<HashMap<String, CounterEntry>>,
    available: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        MemoryKvStore {
            entries: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle reachability; consumers see store errors while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NexusError::new(
                ErrorCode::DatabaseDown,
                "kv store unreachable",
                "store",
            ))
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.expired() {
                entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.check_available()?;
        self.entries.lock().insert(
            key.to_string(),
            KvEntry {
                value: value.to_string(),
                expires_at: Some(Utc::now() + Duration::seconds(ttl_secs as i64)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn incr_expire(&self, key: &str, window_secs: u64) -> Result<u64> {
        self.check_available()?;
        let mut counters = self.counters.lock();
        let now = Utc::now();

        let entry = counters.entry(key.to_string()).or_insert_with(|| CounterEntry {
            count: 0,
            expires_at: now + Duration::seconds(window_secs as i64),
        });

        // Window elapsed: the counter starts over, expiry included.
        if now > entry.expires_at {
            entry.count = 0;
            entry.expires_at = now + Duration::seconds(window_secs as i64);
        }

        entry.count += 1;
        Ok(entry.count)
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

/// In-memory [`DocumentStore`].
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<String, HashMap<String, serde_json::Value>>>,
    available: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        MemoryDocumentStore {
            collections: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NexusError::new(
                ErrorCode::DatabaseDown,
                "document store unreachable",
                "store",
            ))
        }
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, collection: &str, id: &str, doc: serde_json::Value) -> Result<()> {
        self.check_available()?;
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>> {
        self.check_available()?;
        Ok(self
            .collections
            .lock()
            .get(collection)
            .and_then(|docs| docs.get(id).cloned()))
    }

    async fn list_ids(&self, collection: &str) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self
            .collections
            .lock()
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.check_available()?;
        if let Some(docs) = self.collections.lock().get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
