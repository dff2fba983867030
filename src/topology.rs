//! Top-level orchestration of sharded collections.
//!
//! `ShardTopologyManager` owns one registry per collection and is the only
//! component that changes topology. Every mutation holds the collection's gate
//! exclusively, which serializes mutations per collection and keeps data
//! access out until the new layout is committed.

use crate::backend::{CacheBackend, DocumentStore, EventBus, ShardingEvent, ShardingEventKind};
use crate::config::{ShardStrategy, ShardingConfig, ShardingPolicy};
use crate::core::{Filter, FindOptions, Result, ShardError, Value};
use crate::rebalance::{
    imbalance, needs_rebalancing, RebalanceCoordinator, RebalanceReport, RebalanceState,
    ShardLoadSample,
};
use crate::registry::{ShardLayout, ShardMetadata, ShardRegistry, ShardStatus};
use crate::resolver;
use crate::routing_cache::RoutingCache;
use crate::store::ShardedStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{Instrument, Level, event, info_span};

/// Outcome of `add_shard` / `remove_shard`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyChangeReport {
    pub collection: String,
    pub shard_name: String,
    /// Slot of the added shard, or the slot the removed shard occupied.
    pub shard_index: usize,
    pub shard_count: usize,
    pub generation: u64,
    pub migrated_documents: u64,
    pub rebalance: Option<RebalanceReport>,
}

/// Read-only diagnostic snapshot of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingStatus {
    pub collection: String,
    pub config: ShardingConfig,
    pub generation: u64,
    pub shards: Vec<ShardMetadata>,
    pub load_samples: Vec<ShardLoadSample>,
    pub imbalance: f64,
    pub needs_rebalancing: bool,
    pub rebalancer: RebalanceState,
}

impl ShardingStatus {
    pub fn total_documents(&self) -> u64 {
        self.load_samples.iter().map(|s| s.document_count).sum()
    }
}

pub struct ShardTopologyManager {
    store: Arc<dyn DocumentStore>,
    events: Arc<dyn EventBus>,
    cache: RoutingCache,
    policy: ShardingPolicy,
    coordinator: RebalanceCoordinator,
    collections: RwLock<HashMap<String, Arc<ShardRegistry>>>,
}

impl ShardTopologyManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<dyn CacheBackend>,
        events: Arc<dyn EventBus>,
        policy: ShardingPolicy,
    ) -> Result<Self> {
        policy.validate()?;
        let cache = RoutingCache::new(cache, policy.routing_cache_ttl_duration());
        let coordinator = RebalanceCoordinator::new(events.clone(), cache.clone(), policy.clone());
        Ok(Self {
            store,
            events,
            cache,
            policy,
            coordinator,
            collections: RwLock::new(HashMap::new()),
        })
    }

    pub fn policy(&self) -> &ShardingPolicy {
        &self.policy
    }

    pub fn coordinator(&self) -> &RebalanceCoordinator {
        &self.coordinator
    }

    pub async fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Shards a new collection. Fails without leaving partial state.
    pub async fn initialize_sharding(
        &self,
        collection: &str,
        config: ShardingConfig,
    ) -> Result<ShardedStore> {
        let mut collections = self.collections.write().await;
        if collections.contains_key(collection) {
            return Err(ShardError::AlreadySharded(collection.to_string()));
        }

        let registry = ShardRegistry::initialize(self.store.clone(), collection, config.clone()).await?;
        let shards: Vec<String> = registry.handles()?.into_iter().map(|h| h.name).collect();
        collections.insert(collection.to_string(), registry.clone());
        drop(collections);

        self.events
            .emit(ShardingEvent::new(
                ShardingEventKind::Initialized,
                collection,
                json!({
                    "shard_key": config.shard_key,
                    "strategy": config.strategy.as_str(),
                    "shard_count": config.shard_count,
                    "shards": shards,
                }),
            ))
            .await?;
        Ok(self.store_for(registry))
    }

    /// Registers a collection sharded by an earlier process from its metadata rows.
    pub async fn open_existing(&self, collection: &str) -> Result<ShardedStore> {
        let mut collections = self.collections.write().await;
        if let Some(registry) = collections.get(collection) {
            return Ok(self.store_for(registry.clone()));
        }
        let registry = ShardRegistry::load(self.store.clone(), collection).await?;
        collections.insert(collection.to_string(), registry.clone());
        Ok(self.store_for(registry))
    }

    pub async fn sharded_store(&self, collection: &str) -> Result<ShardedStore> {
        Ok(self.store_for(self.registry(collection).await?))
    }

    pub async fn registry(&self, collection: &str) -> Result<Arc<ShardRegistry>> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .ok_or_else(|| ShardError::NotSharded(collection.to_string()))
    }

    fn store_for(&self, registry: Arc<ShardRegistry>) -> ShardedStore {
        ShardedStore::new(registry, self.cache.clone(), self.policy.clone())
    }

    /// Adds one shard and rebalances so it receives its share.
    ///
    /// Hash collections append a slot. Range collections split the most
    /// populated shard at the median shard-key value of its documents.
    pub async fn add_shard(&self, collection: &str) -> Result<TopologyChangeReport> {
        let registry = self.registry(collection).await?;
        let span = info_span!("topology.add_shard", collection);
        async move {
            let _gate = registry.gate().write().await;
            ensure_no_removal_in_progress(&registry, None)?;
            let layout = registry.layout()?;
            let (slot, boundary) = match layout.config.strategy {
                ShardStrategy::Hash => (layout.len(), None),
                ShardStrategy::Range => {
                    let (slot, boundary) = self.split_point(&layout).await?;
                    (slot, Some(boundary))
                }
            };
            self.grow(&registry, slot, boundary).await
        }
        .instrument(span)
        .await
    }

    /// Adds a range shard starting at an explicit boundary.
    pub async fn add_range_shard(
        &self,
        collection: &str,
        boundary: impl Into<Value>,
    ) -> Result<TopologyChangeReport> {
        let boundary = boundary.into();
        let registry = self.registry(collection).await?;
        let span = info_span!("topology.add_range_shard", collection, boundary = %boundary);
        async move {
            let _gate = registry.gate().write().await;
            ensure_no_removal_in_progress(&registry, None)?;
            let layout = registry.layout()?;
            if layout.config.strategy != ShardStrategy::Range {
                return Err(ShardError::InvalidConfig(format!(
                    "collection '{}' is not range sharded",
                    collection
                )));
            }
            if boundary.is_null() {
                return Err(ShardError::InvalidConfig(
                    "range boundary must not be null".to_string(),
                ));
            }

            let mut slot = 0;
            for existing in &layout.config.ranges {
                let ord = existing
                    .compare(&boundary)
                    .map_err(|err| ShardError::InvalidConfig(err.to_string()))?;
                if ord != Ordering::Greater {
                    slot += 1;
                }
            }
            self.grow(&registry, slot, Some(boundary)).await
        }
        .instrument(span)
        .await
    }

    async fn grow(
        &self,
        registry: &ShardRegistry,
        slot: usize,
        boundary: Option<Value>,
    ) -> Result<TopologyChangeReport> {
        let collection = registry.collection();
        let meta = registry.provision_shard(slot, boundary).await?;
        let shard_count = registry.handles()?.len();
        let generation = registry.update_shard_count(shard_count).await?;

        self.events
            .emit(ShardingEvent::new(
                ShardingEventKind::ShardAdded,
                collection,
                json!({
                    "shard": meta.shard_name,
                    "slot": meta.shard_index,
                    "range_start": meta.range_start.as_ref().map(Value::to_json),
                    "shard_count": shard_count,
                    "generation": generation,
                }),
            ))
            .await?;
        event!(Level::INFO, shard = %meta.shard_name, shard_count, generation, "shard added");

        let rebalance = self.coordinator.rebalance(&registry.layout()?).await?;
        Ok(TopologyChangeReport {
            collection: collection.to_string(),
            shard_name: meta.shard_name,
            shard_index: meta.shard_index,
            shard_count,
            generation,
            migrated_documents: rebalance.moved_documents,
            rebalance: Some(rebalance),
        })
    }

    /// Chooses where a range collection splits for a new shard.
    async fn split_point(&self, layout: &ShardLayout) -> Result<(usize, Value)> {
        let mut samples = self.coordinator.analyze(layout).await?;
        samples.sort_by(|a, b| {
            b.document_count
                .cmp(&a.document_count)
                .then(a.shard_index.cmp(&b.shard_index))
        });

        for sample in &samples {
            let handle = layout.handle(sample.shard_index)?;
            let docs = handle
                .store()
                .find(&handle.name, &Filter::all(), &FindOptions::new())
                .await
                .map_err(|err| err.on_shard(handle.name.clone()))?;
            let mut keys: Vec<Value> = docs
                .iter()
                .filter_map(|doc| resolver::shard_key_of(&layout.config, doc).ok().cloned())
                .collect();
            keys.sort_by(|a, b| a.sort_cmp(b));
            keys.dedup();
            if keys.len() >= 2 {
                return Ok((sample.shard_index + 1, keys[keys.len() / 2].clone()));
            }
        }
        Err(ShardError::InvalidConfig(format!(
            "no shard of '{}' holds two distinct keys to split at; use add_range_shard",
            layout.collection
        )))
    }

    /// Drains the shard at `index` into the remaining shards, then retires it.
    ///
    /// Targets are computed against the post-removal layout. A hash removal
    /// changes the modulus, so every shard is re-placed, not only the drained
    /// one. Reads and writes
    /// of the collection wait until the removal finishes. A failed removal
    /// leaves the shard draining; calling this again resumes it.
    pub async fn remove_shard(&self, collection: &str, index: usize) -> Result<TopologyChangeReport> {
        let registry = self.registry(collection).await?;
        let span = info_span!("topology.remove_shard", collection, index);
        async move {
            let _gate = registry.gate().write().await;
            ensure_no_removal_in_progress(&registry, Some(index))?;
            let layout = registry.layout()?;
            if layout.len() < 2 {
                return Err(ShardError::InvalidConfig(format!(
                    "cannot remove the last shard of '{}'",
                    collection
                )));
            }
            let draining = layout.handle(index).map_err(|_| {
                ShardError::InvalidConfig(format!(
                    "collection '{}' has no shard at slot {}",
                    collection, index
                ))
            })?;
            let post_removal = registry.layout_without(index)?;

            let sources = match layout.config.strategy {
                ShardStrategy::Hash => layout.shards.as_slice(),
                ShardStrategy::Range => std::slice::from_ref(draining),
            };

            registry.mark_draining(index).await?;
            let (tasks, moved) = self
                .coordinator
                .drain(&post_removal, &layout.shards, sources)
                .await?;

            let left_behind = draining
                .store()
                .count(&draining.name, &Filter::all())
                .await
                .map_err(|err| err.on_shard(draining.name.clone()))?;
            if left_behind > 0 {
                return Err(ShardError::MigrationFailed {
                    task: format!("drain {}", draining.name),
                    completed_tasks: tasks.len(),
                    reason: format!("{} document(s) still on the draining shard", left_behind),
                });
            }

            let retired = registry.retire_shard(index).await?;
            let shard_count = layout.len() - 1;
            let generation = registry.update_shard_count(shard_count).await?;

            self.events
                .emit(ShardingEvent::new(
                    ShardingEventKind::ShardRemoved,
                    collection,
                    json!({
                        "shard": retired.shard_name,
                        "slot": index,
                        "moved_documents": moved,
                        "shard_count": shard_count,
                        "generation": generation,
                    }),
                ))
                .await?;
            event!(Level::INFO, shard = %retired.shard_name, moved, shard_count, "shard removed");

            Ok(TopologyChangeReport {
                collection: collection.to_string(),
                shard_name: retired.shard_name,
                shard_index: index,
                shard_count,
                generation,
                migrated_documents: moved,
                rebalance: None,
            })
        }
        .instrument(span)
        .await
    }

    /// Rebalances a collection; a no-op when balanced and nothing is misplaced.
    pub async fn rebalance(&self, collection: &str) -> Result<RebalanceReport> {
        let registry = self.registry(collection).await?;
        let _gate = registry.gate().write().await;
        ensure_no_removal_in_progress(&registry, None)?;
        self.coordinator.rebalance(&registry.layout()?).await
    }

    pub async fn status(&self, collection: &str) -> Result<ShardingStatus> {
        let registry = self.registry(collection).await?;
        let _gate = registry.gate().read().await;
        let layout = registry.layout()?;
        let load_samples = self.coordinator.analyze(&layout).await?;
        Ok(ShardingStatus {
            collection: collection.to_string(),
            config: layout.config.clone(),
            generation: layout.generation,
            shards: registry.metadata()?,
            imbalance: imbalance(&load_samples),
            needs_rebalancing: needs_rebalancing(&load_samples, &self.policy),
            load_samples,
            rebalancer: self.coordinator.state(collection)?,
        })
    }
}

/// A draining shard blocks every topology change except resuming its own removal.
fn ensure_no_removal_in_progress(registry: &ShardRegistry, resuming: Option<usize>) -> Result<()> {
    let draining = registry
        .metadata()?
        .into_iter()
        .find(|meta| meta.status == ShardStatus::Draining);
    match draining {
        Some(meta) if Some(meta.shard_index) != resuming => Err(ShardError::InvalidConfig(format!(
            "removal of '{}' is in progress; call remove_shard({}) to resume it",
            meta.shard_name, meta.shard_index
        ))),
        _ => Ok(()),
    }
}
