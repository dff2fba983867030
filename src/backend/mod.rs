//! Collaborator interfaces consumed by the sharding layer.
//!
//! - **`DocumentStore`**: per-shard document storage (CRUD, indexes, aggregation).
//! - **`CacheBackend`**: TTL key-value cache, used only to memoize routing.
//! - **`EventBus`**: lifecycle notifications.
//!
//! In-memory implementations of all three live here as well; they back the
//! test-suite and the `shard-tool simulate` command.

pub mod events;
pub mod memory_cache;
pub mod memory_store;

use crate::config::IndexSpec;
use crate::core::{Document, Filter, FindOptions, Result, Stage, UpdateSpec};
use async_trait::async_trait;
use std::time::Duration;

pub use events::{BroadcastEventBus, ShardingEvent, ShardingEventKind};
pub use memory_cache::InMemoryCache;
pub use memory_store::{FailureMode, InMemoryDocumentStore};

/// Physical document storage addressed by collection name.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_collection(&self, name: &str) -> Result<()>;

    async fn drop_collection(&self, name: &str) -> Result<()>;

    async fn collection_exists(&self, name: &str) -> Result<bool>;

    async fn create_index(&self, name: &str, index: &IndexSpec) -> Result<()>;

    /// Inserts one document, assigning `_id` when absent. Fails on a duplicate `_id`.
    async fn insert(&self, name: &str, doc: Document) -> Result<Document>;

    async fn insert_many(&self, name: &str, docs: Vec<Document>) -> Result<Vec<Document>>;

    /// Inserts or replaces the document with the same `_id`.
    async fn upsert(&self, name: &str, doc: Document) -> Result<()>;

    async fn find(
        &self,
        name: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>>;

    /// Returns the number of modified documents.
    async fn update(&self, name: &str, filter: &Filter, update: &UpdateSpec) -> Result<u64>;

    /// Returns the number of deleted documents.
    async fn delete(&self, name: &str, filter: &Filter) -> Result<u64>;

    async fn aggregate(&self, name: &str, pipeline: &[Stage]) -> Result<Vec<Document>>;

    async fn count(&self, name: &str, filter: &Filter) -> Result<u64>;

    async fn collection_size_bytes(&self, name: &str) -> Result<u64>;
}

/// String cache with per-entry TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Publishes lifecycle events.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn emit(&self, event: ShardingEvent) -> Result<()>;
}
