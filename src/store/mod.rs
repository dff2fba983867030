//! Shard-aware document access.
//!
//! `ShardedStore` is the façade application code talks to. Every operation
//! resolves its target shards from a layout snapshot taken under the
//! collection's gate, fans out to them concurrently and merges the partial
//! results. Topology changes hold the gate exclusively, so an operation never
//! straddles two layouts.

mod merge;
mod targeting;

use crate::config::ShardingPolicy;
use crate::core::{
    Document, Filter, FindOptions, Result, ShardError, ShardFailure, Stage, UpdateSpec, Value,
    ID_FIELD,
};
use crate::registry::{ShardHandle, ShardLayout, ShardRegistry};
use crate::resolver;
use crate::routing_cache::RoutingCache;
use futures::future::{join_all, try_join_all};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use targeting::ShardTargets;
use tracing::{Instrument, Level, event, info_span};

#[derive(Clone)]
pub struct ShardedStore {
    registry: Arc<ShardRegistry>,
    cache: RoutingCache,
    policy: ShardingPolicy,
}

impl std::fmt::Debug for ShardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("collection", &self.registry.collection())
            .finish_non_exhaustive()
    }
}

impl ShardedStore {
    pub fn new(registry: Arc<ShardRegistry>, cache: RoutingCache, policy: ShardingPolicy) -> Self {
        Self {
            registry,
            cache,
            policy,
        }
    }

    pub fn collection(&self) -> &str {
        self.registry.collection()
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    /// Inserts one document on the shard its key resolves to.
    ///
    /// `ShardUnavailable` is retried with backoff per the insert retry policy;
    /// the gate is released between attempts so a topology change can finish.
    pub async fn insert(&self, mut doc: Document) -> Result<Document> {
        doc.ensure_id();
        let span = info_span!("sharded.insert", collection = %self.collection());
        async move {
            let retry = &self.policy.insert_retry;
            let mut attempt = 1;
            loop {
                match self.insert_once(doc.clone()).await {
                    Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                        event!(Level::WARN, error = %err, attempt, "insert retry after transient failure");
                        tokio::time::sleep(retry.backoff(attempt)).await;
                        attempt += 1;
                    }
                    outcome => return outcome,
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn insert_once(&self, doc: Document) -> Result<Document> {
        let _gate = self.registry.gate().read().await;
        let layout = self.registry.layout()?;
        let key = resolver::shard_key_of(&layout.config, &doc)?.clone();
        let handle = layout.owner_of_key(&key)?;

        let stored = handle
            .store()
            .insert(&handle.name, doc)
            .await
            .map_err(|err| err.on_shard(handle.name.clone()))?;
        self.cache
            .remember_quietly(&layout.collection, layout.generation, &key, &handle.name)
            .await;
        event!(Level::DEBUG, shard = %handle.name, "document inserted");
        Ok(stored)
    }

    /// Inserts many documents with one bulk call per target shard, in parallel.
    ///
    /// Results come back in input order. A failing shard does not undo the
    /// partitions that were committed on other shards.
    pub async fn bulk_insert(&self, docs: Vec<Document>) -> Result<Vec<Document>> {
        let span = info_span!("sharded.bulk_insert", collection = %self.collection(), docs = docs.len());
        async move {
            let _gate = self.registry.gate().read().await;
            let layout = self.registry.layout()?;
            let total = docs.len();

            let mut partitions: BTreeMap<usize, (Vec<usize>, Vec<Document>)> = BTreeMap::new();
            for (position, mut doc) in docs.into_iter().enumerate() {
                doc.ensure_id();
                let slot = layout.slot_for_key(resolver::shard_key_of(&layout.config, &doc)?)?;
                let partition = partitions.entry(slot).or_default();
                partition.0.push(position);
                partition.1.push(doc);
            }

            let mut branches = Vec::with_capacity(partitions.len());
            for (slot, (positions, batch)) in partitions {
                let handle = layout.handle(slot)?.clone();
                branches.push(async move {
                    let outcome = handle
                        .store()
                        .insert_many(&handle.name, batch)
                        .await
                        .map_err(|err| err.on_shard(handle.name.clone()));
                    (handle, positions, outcome)
                });
            }
            let outcomes = self.bounded("bulk_insert", join_all(branches)).await?;

            let mut ordered: Vec<Option<Document>> = vec![None; total];
            let mut failures = Vec::new();
            let mut succeeded = 0;
            for (handle, positions, outcome) in outcomes {
                match outcome {
                    Ok(stored) => {
                        succeeded += 1;
                        for (position, doc) in positions.into_iter().zip(stored) {
                            ordered[position] = Some(doc);
                        }
                    }
                    Err(err) => {
                        event!(Level::ERROR, shard = %handle.name, error = %err, "bulk insert partition failed");
                        failures.push(failure(&handle, &err));
                    }
                }
            }

            if !failures.is_empty() {
                return Err(ShardError::PartialFailure {
                    operation: "bulk_insert".to_string(),
                    failures,
                    succeeded,
                });
            }
            Ok(ordered.into_iter().flatten().collect())
        }
        .instrument(span)
        .await
    }

    /// Finds documents across the shards the filter can match.
    ///
    /// Shards return sorted, unpaginated results; skip and limit apply only
    /// after the global merge.
    pub async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<Document>> {
        let span = info_span!("sharded.find", collection = %self.collection());
        async move {
            let _gate = self.registry.gate().read().await;
            let layout = self.registry.layout()?;
            let targets = self.target_handles(&layout, filter).await?;
            event!(Level::DEBUG, shards = targets.len(), "find targets resolved");

            let shard_options = options.without_pagination();
            let branches = targets.iter().map(|handle| {
                let shard_options = &shard_options;
                async move {
                    handle
                        .store()
                        .find(&handle.name, filter, shard_options)
                        .await
                        .map_err(|err| err.on_shard(handle.name.clone()))
                }
            });
            let parts = self.bounded("find", try_join_all(branches)).await??;
            let merged = merge::merge_documents(parts, &options.sort);
            Ok(options.paginate(merged))
        }
        .instrument(span)
        .await
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64> {
        let span = info_span!("sharded.count", collection = %self.collection());
        async move {
            let _gate = self.registry.gate().read().await;
            let layout = self.registry.layout()?;
            let targets = self.target_handles(&layout, filter).await?;
            let branches = targets.iter().map(|handle| async move {
                handle
                    .store()
                    .count(&handle.name, filter)
                    .await
                    .map_err(|err| err.on_shard(handle.name.clone()))
            });
            let counts = self.bounded("count", try_join_all(branches)).await??;
            Ok(counts.into_iter().sum())
        }
        .instrument(span)
        .await
    }

    /// Updates matching documents; returns the total modified count.
    ///
    /// Updates may not change the shard key or `_id`: either would move the
    /// document to a different owner.
    pub async fn update(&self, filter: &Filter, update: &UpdateSpec) -> Result<u64> {
        let span = info_span!("sharded.update", collection = %self.collection());
        async move {
            let _gate = self.registry.gate().read().await;
            let layout = self.registry.layout()?;
            for field in [layout.config.shard_key.as_str(), ID_FIELD] {
                if update.touches(field) {
                    return Err(ShardError::InvalidUpdate(format!(
                        "field '{}' cannot be modified on a sharded collection",
                        field
                    )));
                }
            }

            let targets = self.target_handles(&layout, filter).await?;
            let branches = targets.iter().map(|handle| async move {
                let outcome = handle
                    .store()
                    .update(&handle.name, filter, update)
                    .await
                    .map_err(|err| err.on_shard(handle.name.clone()));
                (handle, outcome)
            });
            let outcomes = self.bounded("update", join_all(branches)).await?;
            sum_counts("update", outcomes)
        }
        .instrument(span)
        .await
    }

    /// Deletes matching documents; returns the total deleted count.
    pub async fn delete(&self, filter: &Filter) -> Result<u64> {
        let span = info_span!("sharded.delete", collection = %self.collection());
        async move {
            let _gate = self.registry.gate().read().await;
            let layout = self.registry.layout()?;
            let targets = self.target_handles(&layout, filter).await?;
            let branches = targets.iter().map(|handle| async move {
                let outcome = handle
                    .store()
                    .delete(&handle.name, filter)
                    .await
                    .map_err(|err| err.on_shard(handle.name.clone()));
                (handle, outcome)
            });
            let outcomes = self.bounded("delete", join_all(branches)).await?;
            sum_counts("delete", outcomes)
        }
        .instrument(span)
        .await
    }

    /// Runs a pipeline on every targeted shard and merges by its last stage.
    ///
    /// A trailing group is re-aggregated, a trailing sort is merge-sorted and
    /// anything else is concatenated. Stages before the last one only see
    /// shard-local data, so pipelines that depend on cross-shard state before
    /// the final stage produce per-shard approximations.
    pub async fn aggregate(&self, pipeline: &[Stage]) -> Result<Vec<Document>> {
        let span = info_span!(
            "sharded.aggregate",
            collection = %self.collection(),
            stages = pipeline.len()
        );
        async move {
            let _gate = self.registry.gate().read().await;
            let layout = self.registry.layout()?;
            let targets = match pipeline.first() {
                Some(Stage::Match(filter)) => self.target_handles(&layout, filter).await?,
                _ => layout.shards.clone(),
            };

            let local = merge::shard_local_pipeline(pipeline);
            let branches = targets.iter().map(|handle| {
                let local = &local;
                async move {
                    handle
                        .store()
                        .aggregate(&handle.name, local)
                        .await
                        .map_err(|err| err.on_shard(handle.name.clone()))
                }
            });
            let parts = self.bounded("aggregate", try_join_all(branches)).await??;
            event!(Level::DEBUG, shards = parts.len(), "aggregate partials gathered");

            Ok(match pipeline.last() {
                Some(Stage::Group(group)) => merge::merge_groups(parts, group),
                Some(Stage::Sort(keys)) => merge::merge_sorted(parts, keys),
                _ => parts.into_iter().flatten().collect(),
            })
        }
        .instrument(span)
        .await
    }

    /// Names of the shards a filter would be sent to.
    pub async fn explain(&self, filter: &Filter) -> Result<Vec<String>> {
        let _gate = self.registry.gate().read().await;
        let layout = self.registry.layout()?;
        Ok(self
            .target_handles(&layout, filter)
            .await?
            .into_iter()
            .map(|handle| handle.name)
            .collect())
    }

    async fn target_handles(&self, layout: &ShardLayout, filter: &Filter) -> Result<Vec<ShardHandle>> {
        match targeting::target_shards(&layout.config, filter) {
            ShardTargets::All => Ok(layout.shards.clone()),
            ShardTargets::Slots(slots) => slots
                .into_iter()
                .map(|slot| layout.handle(slot).cloned())
                .collect(),
            ShardTargets::Keys(keys) => {
                let mut slots = BTreeSet::new();
                for key in &keys {
                    slots.insert(self.route_key(layout, key).await?);
                }
                slots
                    .into_iter()
                    .map(|slot| layout.handle(slot).cloned())
                    .collect()
            }
        }
    }

    /// Routing cache first; the resolver answers misses and stale names.
    async fn route_key(&self, layout: &ShardLayout, key: &Value) -> Result<usize> {
        match self.cache.lookup(&layout.collection, layout.generation, key).await {
            Ok(Some(name)) => {
                if let Some(handle) = layout.by_name(&name) {
                    return Ok(handle.index);
                }
                event!(Level::DEBUG, shard = %name, "cached route names a retired shard");
            }
            Ok(None) => {}
            Err(err) => event!(Level::WARN, error = %err, "routing cache lookup failed"),
        }

        let slot = layout.slot_for_key(key)?;
        let name = &layout.handle(slot)?.name;
        self.cache
            .remember_quietly(&layout.collection, layout.generation, key, name)
            .await;
        Ok(slot)
    }

    async fn bounded<F: Future>(&self, operation: &str, fut: F) -> Result<F::Output> {
        match self.policy.scatter_timeout_duration() {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                ShardError::Timeout(format!(
                    "{} on '{}' exceeded {:?}",
                    operation,
                    self.collection(),
                    limit
                ))
            }),
            None => Ok(fut.await),
        }
    }
}

fn failure(handle: &ShardHandle, err: &ShardError) -> ShardFailure {
    ShardFailure {
        shard_index: handle.index,
        shard_name: handle.name.clone(),
        error: err.root().to_string(),
    }
}

fn sum_counts(operation: &str, outcomes: Vec<(&ShardHandle, Result<u64>)>) -> Result<u64> {
    let mut total = 0;
    let mut succeeded = 0;
    let mut failures = Vec::new();
    for (handle, outcome) in outcomes {
        match outcome {
            Ok(count) => {
                total += count;
                succeeded += 1;
            }
            Err(err) => {
                event!(Level::ERROR, shard = %handle.name, error = %err, operation, "shard branch failed");
                failures.push(failure(handle, &err));
            }
        }
    }
    if failures.is_empty() {
        Ok(total)
    } else {
        Err(ShardError::PartialFailure {
            operation: operation.to_string(),
            failures,
            succeeded,
        })
    }
}
