//! Nexus Store - Shared state interfaces for the Nexus-Vanguard control plane
//!
//! The control plane never talks to a concrete store directly. Rate limiting,
//! idempotency, and incident persistence go through [`KvStore`]; pulse
//! snapshots and incident documents go through [`DocumentStore`]. Concurrency
//! across replicas is delegated to the store's atomic operations, of which
//! [`KvStore::incr_expire`] is the one the token bucket depends on.

use async_trait::async_trait;
use nexus_common::{NexusConfig, Result};
use std::sync::Arc;

mod memory;

pub use memory::{MemoryDocumentStore, MemoryKvStore};

/// Shared key-value store with native TTL support.
#[async_trait]
pub trait KvStore {
    /// Fetch a value by key, honoring expiry.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value with a TTL in seconds.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Remove a key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomic increment-and-expire: bump the counter at `key`, starting the
    /// `window_secs` expiry on first increment, and return the new count.
    /// Replays the original's scripted INCR+EXPIRE in one call.
    async fn incr_expire(&self, key: &str, window_secs: u64) -> Result<u64>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<()>;
}

/// Shared document store organized as collections of JSON documents.
#[async_trait]
pub trait DocumentStore {
    /// Insert or replace a document.
    async fn upsert(&self, collection: &str, id: &str, doc: serde_json::Value) -> Result<()>;

    /// Fetch a document by id.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>>;

    /// List all document ids in a collection.
    async fn list_ids(&self, collection: &str) -> Result<Vec<String>>;

    /// Remove a document.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<()>;
}

/// Create the key-value store backend.
///
/// Remote engines are external collaborators; this process only ever holds
/// the interface. The in-memory backend is used for MEMORY mode and as the
/// container-local stand-in when no remote store is configured.
pub fn create_kv_store(config: &NexusConfig) -> Arc<dyn KvStore + Send + Sync> {
    if config.store.storage_mode != "MEMORY" {
        tracing::info!(
            mode = %config.store.storage_mode,
            url = %config.store.redis_url,
            "Remote kv store requested; using container-local backend in this process"
        );
    }
    Arc::new(MemoryKvStore::new())
}

/// Create the document store backend.
pub fn create_document_store(config: &NexusConfig) -> Arc<dyn DocumentStore + Send + Sync> {
    if config.store.storage_mode != "MEMORY" {
        tracing::info!(
            mode = %config.store.storage_mode,
            "Remote document store requested; using container-local backend in this process"
        );
    }
    Arc::new(MemoryDocumentStore::new())
}
