//! Load analysis and document migration between shards.
//!
//! The resolver is authoritative for placement, so migration is
//! placement-convergent: a task only moves the documents of its source whose
//! owner under the target layout is the task's target. The load plan decides
//! whether rebalancing is worthwhile and in which order tasks run.

mod plan;

pub use plan::{
    estimated_total, imbalance, needs_rebalancing, order_by_load, plan, MigrationTask,
    ShardLoadSample,
};

use crate::backend::{EventBus, ShardingEvent, ShardingEventKind};
use crate::config::ShardingPolicy;
use crate::core::{Filter, FindOptions, Result, ShardError, SortKey, ID_FIELD};
use crate::registry::{ShardHandle, ShardLayout};
use crate::resolver;
use crate::routing_cache::RoutingCache;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{Instrument, Level, event, info_span};

/// Per-collection rebalancer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceState {
    Idle,
    Analyzing,
    Planning,
    Migrating,
    /// The last plan aborted; completed tasks stand and a new run resumes.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub collection: String,
    pub imbalance_before: f64,
    pub imbalance_after: f64,
    /// Whether the load imbalance exceeded the threshold.
    pub triggered: bool,
    /// Load-based estimate, for diagnostics.
    pub load_plan: Vec<MigrationTask>,
    /// Tasks that actually ran.
    pub tasks: Vec<MigrationTask>,
    pub moved_documents: u64,
}

impl RebalanceReport {
    pub fn is_noop(&self) -> bool {
        self.tasks.is_empty()
    }
}

pub struct RebalanceCoordinator {
    events: Arc<dyn EventBus>,
    cache: RoutingCache,
    policy: ShardingPolicy,
    states: Mutex<HashMap<String, RebalanceState>>,
}

impl RebalanceCoordinator {
    pub fn new(events: Arc<dyn EventBus>, cache: RoutingCache, policy: ShardingPolicy) -> Self {
        Self {
            events,
            cache,
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, collection: &str) -> Result<RebalanceState> {
        Ok(self
            .states
            .lock()?
            .get(collection)
            .copied()
            .unwrap_or(RebalanceState::Idle))
    }

    fn set_state(&self, collection: &str, state: RebalanceState) -> Result<()> {
        event!(Level::DEBUG, collection, state = ?state, "rebalancer state");
        self.states.lock()?.insert(collection.to_string(), state);
        Ok(())
    }

    /// Document count and storage size of every shard, sampled concurrently.
    pub async fn analyze(&self, layout: &ShardLayout) -> Result<Vec<ShardLoadSample>> {
        let branches = layout.shards.iter().map(|handle| async move {
            let store = handle.store();
            let all = Filter::all();
            let count = store.count(&handle.name, &all);
            let bytes = store.collection_size_bytes(&handle.name);
            let (count, bytes) = futures::try_join!(count, bytes)
                .map_err(|err| err.on_shard(handle.name.clone()))?;
            Ok::<_, ShardError>(ShardLoadSample::new(
                handle.name.clone(),
                handle.index,
                count,
                bytes,
            ))
        });
        try_join_all(branches).await
    }

    pub fn imbalance(&self, samples: &[ShardLoadSample]) -> f64 {
        plan::imbalance(samples)
    }

    pub fn plan(&self, samples: &[ShardLoadSample]) -> Vec<MigrationTask> {
        plan::plan(samples, &self.policy)
    }

    /// Tasks that bring every document on `sources` to its owner under `placement`.
    ///
    /// Counts are exact at scan time.
    pub async fn placement_plan(
        &self,
        placement: &ShardLayout,
        sources: &[ShardHandle],
    ) -> Result<Vec<MigrationTask>> {
        let mut moves: BTreeMap<(String, String), u64> = BTreeMap::new();
        for source in sources {
            let docs = source
                .store()
                .find(&source.name, &Filter::all(), &FindOptions::new())
                .await
                .map_err(|err| err.on_shard(source.name.clone()))?;
            for doc in &docs {
                let owner = placement.owner_of(doc).map_err(|err| err.on_shard(source.name.clone()))?;
                if owner.name != source.name {
                    *moves
                        .entry((source.name.clone(), owner.name.clone()))
                        .or_insert(0) += 1;
                }
            }
        }
        Ok(moves
            .into_iter()
            .map(|((source, target), count)| MigrationTask::new(source, target, count))
            .collect())
    }

    /// Runs tasks one after another; stops at the first failure.
    ///
    /// `shards` must contain every shard a task names, including shards that
    /// are no longer part of `placement`.
    pub async fn execute(
        &self,
        placement: &ShardLayout,
        shards: &[ShardHandle],
        tasks: &[MigrationTask],
    ) -> Result<u64> {
        let collection = placement.collection.as_str();
        if tasks.is_empty() {
            return Ok(0);
        }
        self.set_state(collection, RebalanceState::Migrating)?;
        let started = ShardingEvent::new(
            ShardingEventKind::MigrationStarted,
            collection,
            json!({
                "tasks": tasks.len(),
                "estimated_documents": estimated_total(tasks),
                "generation": placement.generation,
            }),
        );
        if let Err(err) = self.events.emit(started).await {
            self.set_state(collection, RebalanceState::Failed)?;
            event!(Level::ERROR, error = %err, "migration_started event not delivered");
            return Err(err);
        }

        let mut moved = 0;
        for (completed, task) in tasks.iter().enumerate() {
            match self.migrate_task(placement, shards, task).await {
                Ok(count) => moved += count,
                Err(err) => {
                    self.set_state(collection, RebalanceState::Failed)?;
                    event!(Level::ERROR, task = %task.label(), error = %err, "migration task failed");
                    let failed = ShardingEvent::new(
                        ShardingEventKind::MigrationFailed,
                        collection,
                        json!({
                            "task": task.label(),
                            "completed_tasks": completed,
                            "moved_documents": moved,
                            "reason": err.to_string(),
                        }),
                    );
                    if let Err(emit_err) = self.events.emit(failed).await {
                        event!(Level::ERROR, error = %emit_err, "migration_failed event not delivered");
                    }
                    return Err(ShardError::MigrationFailed {
                        task: task.label(),
                        completed_tasks: completed,
                        reason: err.to_string(),
                    });
                }
            }
        }

        self.set_state(collection, RebalanceState::Idle)?;
        self.events
            .emit(ShardingEvent::new(
                ShardingEventKind::MigrationCompleted,
                collection,
                json!({ "tasks": tasks.len(), "moved_documents": moved }),
            ))
            .await?;
        Ok(moved)
    }

    /// Moves every misplaced document on `sources` to its owner under `placement`.
    ///
    /// Used when a shard is removed: `placement` is the post-removal layout.
    /// Hash removal passes every shard, since the modulus changes for all keys.
    pub async fn drain(
        &self,
        placement: &ShardLayout,
        shards: &[ShardHandle],
        sources: &[ShardHandle],
    ) -> Result<(Vec<MigrationTask>, u64)> {
        let collection = placement.collection.as_str();
        let span = info_span!("rebalance.drain", collection, sources = sources.len());
        async move {
            self.set_state(collection, RebalanceState::Planning)?;
            let tasks = match self.placement_plan(placement, sources).await {
                Ok(tasks) => tasks,
                Err(err) => {
                    self.set_state(collection, RebalanceState::Failed)?;
                    return Err(err);
                }
            };
            let moved = self.execute(placement, shards, &tasks).await?;
            self.set_state(collection, RebalanceState::Idle)?;
            Ok((tasks, moved))
        }
        .instrument(span)
        .await
    }

    /// Moves one task's documents in `_id` order, batch by batch.
    ///
    /// Pages by offset over the documents that stay behind; moved documents
    /// leave the source, so the offset only grows by what was kept. Each document is copied to the target before it is deleted from the
    /// source, so an interruption leaves at most one duplicate and never loses
    /// data. Re-running the task overwrites that duplicate.
    async fn migrate_task(
        &self,
        placement: &ShardLayout,
        shards: &[ShardHandle],
        task: &MigrationTask,
    ) -> Result<u64> {
        let find = |name: &str| {
            shards
                .iter()
                .find(|handle| handle.name == name)
                .ok_or_else(|| ShardError::ShardUnavailable(format!("shard '{}' not found", name)))
        };
        let source = find(&task.source)?;
        let target = find(&task.target)?;
        let batch_size = self.policy.migration_batch_size;

        let span = info_span!("rebalance.task", source = %source.name, target = %target.name);
        async move {
            let mut kept = 0usize;
            let mut moved = 0u64;
            loop {
                let page = FindOptions::new()
                    .sort(SortKey::asc(ID_FIELD))
                    .skip(kept)
                    .limit(batch_size);
                let batch = source
                    .store()
                    .find(&source.name, &Filter::all(), &page)
                    .await
                    .map_err(|err| err.on_shard(source.name.clone()))?;
                let fetched = batch.len();

                for doc in batch {
                    if placement.owner_of(&doc)?.name != target.name {
                        kept += 1;
                        continue;
                    }
                    let key = resolver::shard_key_of(&placement.config, &doc)?.clone();
                    let Some(id) = doc.get(ID_FIELD).cloned() else {
                        kept += 1;
                        continue;
                    };
                    target
                        .store()
                        .upsert(&target.name, doc)
                        .await
                        .map_err(|err| err.on_shard(target.name.clone()))?;
                    source
                        .store()
                        .delete(&source.name, &Filter::all().eq(ID_FIELD, id))
                        .await
                        .map_err(|err| err.on_shard(source.name.clone()))?;
                    self.cache
                        .invalidate(&placement.collection, placement.generation, &key)
                        .await?;
                    moved += 1;
                }

                if fetched < batch_size {
                    break;
                }
            }
            event!(Level::INFO, moved, estimated = task.estimated_document_count, "migration task finished");
            Ok(moved)
        }
        .instrument(span)
        .await
    }

    /// Analyze, plan and migrate until every document sits on its owner.
    ///
    /// Below the imbalance threshold with nothing misplaced this is a no-op.
    pub async fn rebalance(&self, layout: &ShardLayout) -> Result<RebalanceReport> {
        let collection = layout.collection.as_str();
        let span = info_span!("rebalance.run", collection, generation = layout.generation);
        async move {
            let outcome = self.run_rebalance(layout).await;
            if outcome.is_err() {
                self.set_state(collection, RebalanceState::Failed)?;
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_rebalance(&self, layout: &ShardLayout) -> Result<RebalanceReport> {
        let collection = layout.collection.as_str();
        self.set_state(collection, RebalanceState::Analyzing)?;
        let samples = self.analyze(layout).await?;
        let before = plan::imbalance(&samples);

        self.set_state(collection, RebalanceState::Planning)?;
        let load_plan = self.plan(&samples);
        let mut tasks = self.placement_plan(layout, &layout.shards).await?;
        order_by_load(&mut tasks, &samples);
        let triggered = plan::needs_rebalancing(&samples, &self.policy);

        if tasks.is_empty() {
            self.set_state(collection, RebalanceState::Idle)?;
            event!(Level::INFO, imbalance = before, triggered, "nothing to migrate");
            return Ok(RebalanceReport {
                collection: collection.to_string(),
                imbalance_before: before,
                imbalance_after: before,
                triggered,
                load_plan,
                tasks,
                moved_documents: 0,
            });
        }

        let moved = self.execute(layout, &layout.shards, &tasks).await?;
        let after = plan::imbalance(&self.analyze(layout).await?);

        self.events
            .emit(ShardingEvent::new(
                ShardingEventKind::Rebalanced,
                collection,
                json!({
                    "imbalance_before": before,
                    "imbalance_after": after,
                    "tasks": tasks.len(),
                    "moved_documents": moved,
                }),
            ))
            .await?;
        event!(Level::INFO, before, after, moved, "rebalance finished");

        Ok(RebalanceReport {
            collection: collection.to_string(),
            imbalance_before: before,
            imbalance_after: after,
            triggered,
            load_plan,
            tasks,
            moved_documents: moved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BroadcastEventBus, DocumentStore, InMemoryCache, InMemoryDocumentStore};
    use crate::config::ShardingConfig;
    use crate::core::Document;
    use crate::registry::ShardRegistry;
    use async_trait::async_trait;
    use std::time::Duration;

    struct OfflineBus;

    #[async_trait]
    impl EventBus for OfflineBus {
        async fn emit(&self, _event: ShardingEvent) -> Result<()> {
            Err(ShardError::Event("bus offline".to_string()))
        }
    }

    fn coordinator(events: Arc<dyn EventBus>, batch_size: usize) -> RebalanceCoordinator {
        let cache = RoutingCache::new(Arc::new(InMemoryCache::new()), Duration::from_secs(60));
        RebalanceCoordinator::new(
            events,
            cache,
            ShardingPolicy::default().migration_batch_size(batch_size),
        )
    }

    // Two hash shards with every document written straight to shard 0.
    async fn all_on_first_shard(
        store: &Arc<InMemoryDocumentStore>,
        docs: Vec<Document>,
    ) -> Arc<ShardRegistry> {
        let registry = ShardRegistry::initialize(store.clone(), "orders", ShardingConfig::hash("k", 2))
            .await
            .unwrap();
        for doc in docs {
            store.insert("orders_shard_0", doc).await.unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn undelivered_start_event_leaves_the_collection_failed() {
        let store = InMemoryDocumentStore::shared();
        let docs = (0..20).map(|i| Document::new().with("k", format!("k{i}"))).collect();
        let registry = all_on_first_shard(&store, docs).await;
        let coordinator = coordinator(Arc::new(OfflineBus), 100);

        let layout = registry.layout().unwrap();
        let tasks = coordinator.placement_plan(&layout, &layout.shards).await.unwrap();
        assert!(!tasks.is_empty());

        let err = coordinator
            .execute(&layout, &layout.shards, &tasks)
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::Event(_)));
        assert_eq!(coordinator.state("orders").unwrap(), RebalanceState::Failed);
        assert_eq!(
            store.count("orders_shard_0", &Filter::all()).await.unwrap(),
            20
        );
    }

    #[tokio::test]
    async fn mixed_id_kinds_migrate_across_small_batches() {
        let store = InMemoryDocumentStore::shared();
        let mut docs: Vec<Document> = (0..10)
            .map(|i| Document::new().with("_id", i as i64).with("k", format!("int-{i}")))
            .collect();
        docs.extend((0..10).map(|i| Document::new().with("k", format!("uuid-{i}"))));
        let registry = all_on_first_shard(&store, docs).await;
        let coordinator = coordinator(Arc::new(BroadcastEventBus::default()), 3);

        let layout = registry.layout().unwrap();
        let report = coordinator.rebalance(&layout).await.unwrap();
        assert!(report.moved_documents > 0);
        assert_eq!(report.moved_documents, estimated_total(&report.tasks));

        let mut total = 0;
        for handle in &layout.shards {
            let held = store
                .find(&handle.name, &Filter::all(), &FindOptions::new())
                .await
                .unwrap();
            for doc in &held {
                assert_eq!(layout.owner_of(doc).unwrap().name, handle.name);
            }
            total += held.len();
        }
        assert_eq!(total, 20);
        assert_eq!(coordinator.state("orders").unwrap(), RebalanceState::Idle);
    }
}
