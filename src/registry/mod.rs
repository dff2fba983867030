//! Per-collection shard registry.
//!
//! The registry owns the in-memory `ShardingConfig` of one collection and the
//! ordered set of its live shards. The `__shard_metadata` rows are the durable
//! source of truth; `ShardRegistry::load` rebuilds the registry from them alone.
//!
//! A shard's *slot* is its position in the ordered shard list and is what the
//! resolver returns. Physical names are stable across topology changes, so a
//! slot and the ordinal in a shard's name can differ after a removal.

pub mod metadata;

pub use metadata::{METADATA_COLLECTION, ShardMetadata, ShardStatus};

use crate::backend::DocumentStore;
use crate::config::{IndexSpec, ShardStrategy, ShardingConfig};
use crate::core::{Document, Filter, FindOptions, Result, ShardError, SortKey, Value};
use crate::resolver;
use chrono::Utc;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{Level, event, info_span, Instrument};

/// A live shard as seen by data-access code.
#[derive(Clone)]
pub struct ShardHandle {
    pub name: String,
    /// Slot of the shard in the current layout.
    pub index: usize,
    pub status: ShardStatus,
    store: Arc<dyn DocumentStore>,
}

impl ShardHandle {
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}

impl fmt::Debug for ShardHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardHandle")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("status", &self.status)
            .finish()
    }
}

/// Immutable snapshot of a collection's routing state.
#[derive(Debug, Clone)]
pub struct ShardLayout {
    pub collection: String,
    pub config: ShardingConfig,
    pub shards: Vec<ShardHandle>,
    pub generation: u64,
}

impl ShardLayout {
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn handle(&self, slot: usize) -> Result<&ShardHandle> {
        self.shards.get(slot).ok_or_else(|| {
            ShardError::ShardUnavailable(format!(
                "collection '{}' has no shard at slot {}",
                self.collection, slot
            ))
        })
    }

    pub fn by_name(&self, name: &str) -> Option<&ShardHandle> {
        self.shards.iter().find(|handle| handle.name == name)
    }

    pub fn slot_for_key(&self, key: &Value) -> Result<usize> {
        resolver::resolve(&self.config, key)
    }

    pub fn owner_of_key(&self, key: &Value) -> Result<&ShardHandle> {
        self.handle(self.slot_for_key(key)?)
    }

    pub fn owner_of(&self, doc: &Document) -> Result<&ShardHandle> {
        self.owner_of_key(resolver::shard_key_of(&self.config, doc)?)
    }
}

struct RegistryState {
    config: ShardingConfig,
    shards: Vec<ShardMetadata>,
    generation: u64,
}

pub struct ShardRegistry {
    collection: String,
    store: Arc<dyn DocumentStore>,
    state: RwLock<RegistryState>,
    /// Topology mutations hold this for writing, data access for reading.
    gate: tokio::sync::RwLock<()>,
}

impl fmt::Debug for ShardRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardRegistry")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl ShardRegistry {
    /// Provisions every shard of a new sharded collection.
    ///
    /// On failure every shard created by this call is dropped again and no
    /// metadata row survives.
    pub async fn initialize(
        store: Arc<dyn DocumentStore>,
        collection: &str,
        config: ShardingConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        validate_collection_name(collection)?;

        let span = info_span!(
            "registry.initialize",
            collection,
            strategy = config.strategy.as_str(),
            shard_count = config.shard_count
        );
        async move {
            ensure_metadata_collection(store.as_ref()).await?;
            if !read_metadata_rows(store.as_ref(), collection).await?.is_empty() {
                return Err(ShardError::AlreadySharded(collection.to_string()));
            }

            let now = Utc::now();
            let mut created: Vec<String> = Vec::new();
            let mut shards = Vec::with_capacity(config.shard_count);
            for index in 0..config.shard_count {
                let name = resolver::shard_name(collection, index);
                if let Err(err) =
                    provision_physical(store.as_ref(), &name, &config.indexes, &mut created).await
                {
                    rollback(store.as_ref(), &created).await;
                    return Err(ShardError::ProvisioningFailed(format!("{}: {}", name, err)));
                }
                shards.push(ShardMetadata {
                    collection: collection.to_string(),
                    shard_name: name,
                    shard_index: index,
                    range_start: None,
                    range_end: None,
                    status: ShardStatus::Active,
                    created_at: now,
                    updated_at: now,
                    shard_key: config.shard_key.clone(),
                    strategy: config.strategy,
                    indexes: config.indexes.clone(),
                    generation: 1,
                });
            }
            if config.strategy == ShardStrategy::Range {
                for (meta, start) in shards.iter_mut().zip(&config.ranges) {
                    meta.range_start = Some(start.clone());
                }
            }
            renumber(&mut shards);

            if let Err(err) = persist_rows(store.as_ref(), &shards).await {
                rollback(store.as_ref(), &created).await;
                return Err(ShardError::ProvisioningFailed(format!(
                    "metadata write failed: {}",
                    err
                )));
            }

            event!(Level::INFO, shards = shards.len(), "sharded collection provisioned");
            Ok(Arc::new(Self {
                collection: collection.to_string(),
                store: store.clone(),
                state: RwLock::new(RegistryState {
                    config,
                    shards,
                    generation: 1,
                }),
                gate: tokio::sync::RwLock::new(()),
            }))
        }
        .instrument(span)
        .await
    }

    /// Rebuilds a registry from its persisted metadata rows.
    pub async fn load(store: Arc<dyn DocumentStore>, collection: &str) -> Result<Arc<Self>> {
        let mut rows: Vec<ShardMetadata> = read_metadata_rows(store.as_ref(), collection)
            .await?
            .into_iter()
            .filter(|row| row.status != ShardStatus::Retired)
            .collect();
        let Some(first) = rows.first().cloned() else {
            return Err(ShardError::NotSharded(collection.to_string()));
        };
        rows.sort_by_key(|row| row.shard_index);

        let ranges = match first.strategy {
            ShardStrategy::Hash => Vec::new(),
            ShardStrategy::Range => rows
                .iter()
                .map(|row| {
                    row.range_start.clone().ok_or_else(|| {
                        ShardError::Serialization(format!(
                            "range shard '{}' has no range_start",
                            row.shard_name
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };
        let config = ShardingConfig {
            shard_key: first.shard_key.clone(),
            strategy: first.strategy,
            shard_count: rows.len(),
            ranges,
            indexes: first.indexes.clone(),
        };
        config.validate()?;
        let generation = rows.iter().map(|row| row.generation).max().unwrap_or(1);
        renumber(&mut rows);

        event!(
            Level::INFO,
            collection,
            shards = rows.len(),
            generation,
            "shard registry reloaded"
        );
        Ok(Arc::new(Self {
            collection: collection.to_string(),
            store,
            state: RwLock::new(RegistryState {
                config,
                shards: rows,
                generation,
            }),
            gate: tokio::sync::RwLock::new(()),
        }))
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> Result<ShardingConfig> {
        Ok(self.state.read()?.config.clone())
    }

    pub fn generation(&self) -> Result<u64> {
        Ok(self.state.read()?.generation)
    }

    pub fn metadata(&self) -> Result<Vec<ShardMetadata>> {
        Ok(self.state.read()?.shards.clone())
    }

    /// Live shards in slot order.
    pub fn handles(&self) -> Result<Vec<ShardHandle>> {
        let state = self.state.read()?;
        Ok(self.handles_of(&state.shards))
    }

    pub fn layout(&self) -> Result<ShardLayout> {
        let state = self.state.read()?;
        Ok(ShardLayout {
            collection: self.collection.clone(),
            config: state.config.clone(),
            shards: self.handles_of(&state.shards),
            generation: state.generation,
        })
    }

    /// Layout the collection will have once the shard at `slot` is gone.
    pub fn layout_without(&self, slot: usize) -> Result<ShardLayout> {
        let mut layout = self.layout()?;
        if slot >= layout.shards.len() || layout.shards.len() < 2 {
            return Err(ShardError::InvalidConfig(format!(
                "cannot remove slot {} from a collection with {} shard(s)",
                slot,
                layout.shards.len()
            )));
        }
        layout.shards.remove(slot);
        for (index, handle) in layout.shards.iter_mut().enumerate() {
            handle.index = index;
        }
        layout.config.shard_count -= 1;
        if layout.config.strategy == ShardStrategy::Range {
            // The removed range merges into its lower neighbour; slot 0 merges upward.
            let dropped = if slot == 0 { 1 } else { slot };
            layout.config.ranges.remove(dropped);
        }
        Ok(layout)
    }

    pub(crate) fn gate(&self) -> &tokio::sync::RwLock<()> {
        &self.gate
    }

    /// Creates a new physical shard at `slot` without changing the shard count.
    ///
    /// The caller commits the topology with `update_shard_count` afterwards.
    pub async fn provision_shard(
        &self,
        slot: usize,
        range_start: Option<Value>,
    ) -> Result<ShardMetadata> {
        let mut next = self.metadata()?;
        let config = self.config()?;
        if config.strategy == ShardStrategy::Range && range_start.is_none() {
            return Err(ShardError::InvalidConfig(
                "a range shard needs a lower boundary".to_string(),
            ));
        }

        let name = self.unused_shard_name(&next).await?;
        let mut created = Vec::new();
        if let Err(err) =
            provision_physical(self.store.as_ref(), &name, &config.indexes, &mut created).await
        {
            rollback(self.store.as_ref(), &created).await;
            return Err(ShardError::ProvisioningFailed(format!("{}: {}", name, err)));
        }

        let now = Utc::now();
        let slot = slot.min(next.len());
        next.insert(
            slot,
            ShardMetadata {
                collection: self.collection.clone(),
                shard_name: name.clone(),
                shard_index: slot,
                range_start,
                range_end: None,
                status: ShardStatus::Active,
                created_at: now,
                updated_at: now,
                shard_key: config.shard_key.clone(),
                strategy: config.strategy,
                indexes: config.indexes.clone(),
                generation: self.generation()?,
            },
        );
        renumber(&mut next);

        if let Err(err) = persist_rows(self.store.as_ref(), &next).await {
            rollback(self.store.as_ref(), &created).await;
            if let Err(cleanup) = self
                .store
                .delete(METADATA_COLLECTION, &Filter::by_id(name.clone()))
                .await
            {
                event!(Level::WARN, error = %cleanup, shard = %name, "metadata cleanup failed");
            }
            return Err(ShardError::ProvisioningFailed(format!(
                "metadata write failed: {}",
                err
            )));
        }

        let meta = next[slot].clone();
        self.state.write()?.shards = next;
        event!(Level::INFO, collection = %self.collection, shard = %name, slot, "shard provisioned");
        Ok(meta)
    }

    /// Marks the shard at `slot` as draining.
    pub async fn mark_draining(&self, slot: usize) -> Result<ShardMetadata> {
        let mut next = self.metadata()?;
        let meta = next.get_mut(slot).ok_or_else(|| missing_slot(&self.collection, slot))?;
        if meta.status == ShardStatus::Draining {
            // resuming an interrupted removal
            return Ok(meta.clone());
        }
        meta.transition(ShardStatus::Draining)?;
        let meta = meta.clone();
        self.store
            .upsert(METADATA_COLLECTION, meta.to_document()?)
            .await
            .map_err(|err| err.on_shard(meta.shard_name.clone()))?;
        self.state.write()?.shards = next;
        Ok(meta)
    }

    /// Retires a drained shard: drops its physical collection and its row.
    pub async fn retire_shard(&self, slot: usize) -> Result<ShardMetadata> {
        let mut next = self.metadata()?;
        if slot >= next.len() {
            return Err(missing_slot(&self.collection, slot));
        }
        let mut retired = next.remove(slot);
        retired.transition(ShardStatus::Retired)?;
        let name = retired.shard_name.clone();

        self.store
            .upsert(METADATA_COLLECTION, retired.to_document()?)
            .await
            .map_err(|err| err.on_shard(name.clone()))?;
        self.store
            .drop_collection(&name)
            .await
            .map_err(|err| err.on_shard(name.clone()))?;
        self.store
            .delete(METADATA_COLLECTION, &Filter::by_id(name.clone()))
            .await
            .map_err(|err| err.on_shard(name.clone()))?;

        if slot == 0
            && let Some(first) = next.first_mut()
        {
            first.range_start = retired.range_start.clone();
        }
        renumber(&mut next);
        persist_rows(self.store.as_ref(), &next).await?;

        self.state.write()?.shards = next;
        event!(Level::INFO, collection = %self.collection, shard = %name, "shard retired");
        Ok(retired)
    }

    /// Commits a new shard count once the physical topology matches it.
    ///
    /// Returns the new topology generation.
    pub async fn update_shard_count(&self, new_count: usize) -> Result<u64> {
        let (config, mut rows, generation) = {
            let state = self.state.read()?;
            if state.shards.len() != new_count {
                return Err(ShardError::InvalidConfig(format!(
                    "collection '{}' has {} physical shard(s), cannot set shard_count to {}",
                    self.collection,
                    state.shards.len(),
                    new_count
                )));
            }
            if let Some(draining) = state
                .shards
                .iter()
                .find(|meta| meta.status != ShardStatus::Active)
            {
                return Err(ShardError::InvalidConfig(format!(
                    "shard '{}' is still {}",
                    draining.shard_name,
                    draining.status.as_str()
                )));
            }

            let mut config = state.config.clone();
            config.shard_count = new_count;
            if config.strategy == ShardStrategy::Range {
                config.ranges = state
                    .shards
                    .iter()
                    .map(|meta| meta.range_start.clone().unwrap_or(Value::Null))
                    .collect();
            }
            config.validate()?;
            (config, state.shards.clone(), state.generation + 1)
        };

        let now = Utc::now();
        for meta in rows.iter_mut() {
            meta.generation = generation;
            meta.updated_at = now;
        }
        persist_rows(self.store.as_ref(), &rows).await?;

        let mut state = self.state.write()?;
        state.config = config;
        state.shards = rows;
        state.generation = generation;
        event!(
            Level::INFO,
            collection = %self.collection,
            shard_count = new_count,
            generation,
            "shard count committed"
        );
        Ok(generation)
    }

    fn handles_of(&self, shards: &[ShardMetadata]) -> Vec<ShardHandle> {
        shards
            .iter()
            .enumerate()
            .map(|(slot, meta)| ShardHandle {
                name: meta.shard_name.clone(),
                index: slot,
                status: meta.status,
                store: self.store.clone(),
            })
            .collect()
    }

    async fn unused_shard_name(&self, shards: &[ShardMetadata]) -> Result<String> {
        let taken: HashSet<&str> = shards.iter().map(|meta| meta.shard_name.as_str()).collect();
        let mut ordinal = 0;
        loop {
            let candidate = resolver::shard_name(&self.collection, ordinal);
            if !taken.contains(candidate.as_str())
                && !self.store.collection_exists(&candidate).await?
            {
                return Ok(candidate);
            }
            ordinal += 1;
        }
    }
}

fn validate_collection_name(collection: &str) -> Result<()> {
    if collection.trim().is_empty() {
        return Err(ShardError::InvalidConfig(
            "collection name must not be empty".to_string(),
        ));
    }
    if collection == METADATA_COLLECTION {
        return Err(ShardError::InvalidConfig(format!(
            "'{}' is reserved",
            METADATA_COLLECTION
        )));
    }
    Ok(())
}

fn missing_slot(collection: &str, slot: usize) -> ShardError {
    ShardError::InvalidConfig(format!(
        "collection '{}' has no shard at slot {}",
        collection, slot
    ))
}

/// Slots follow list order; range ends follow the next shard's start.
fn renumber(shards: &mut [ShardMetadata]) {
    let starts: Vec<Option<Value>> = shards.iter().map(|meta| meta.range_start.clone()).collect();
    for (slot, meta) in shards.iter_mut().enumerate() {
        meta.shard_index = slot;
        meta.range_end = match meta.strategy {
            ShardStrategy::Range => starts.get(slot + 1).cloned().flatten(),
            ShardStrategy::Hash => None,
        };
    }
}

async fn ensure_metadata_collection(store: &dyn DocumentStore) -> Result<()> {
    if store.collection_exists(METADATA_COLLECTION).await? {
        return Ok(());
    }
    match store.create_collection(METADATA_COLLECTION).await {
        Ok(()) | Err(ShardError::CollectionExists(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

async fn read_metadata_rows(store: &dyn DocumentStore, collection: &str) -> Result<Vec<ShardMetadata>> {
    if !store.collection_exists(METADATA_COLLECTION).await? {
        return Ok(Vec::new());
    }
    let docs = store
        .find(
            METADATA_COLLECTION,
            &Filter::all().eq("collection", collection),
            &FindOptions::new().sort(SortKey::asc("shard_index")),
        )
        .await?;
    docs.iter().map(ShardMetadata::from_document).collect()
}

async fn persist_rows(store: &dyn DocumentStore, rows: &[ShardMetadata]) -> Result<()> {
    for row in rows {
        store
            .upsert(METADATA_COLLECTION, row.to_document()?)
            .await
            .map_err(|err| err.on_shard(row.shard_name.clone()))?;
    }
    Ok(())
}

async fn provision_physical(
    store: &dyn DocumentStore,
    name: &str,
    indexes: &[IndexSpec],
    created: &mut Vec<String>,
) -> Result<()> {
    store.create_collection(name).await?;
    created.push(name.to_string());
    for index in indexes {
        store.create_index(name, index).await?;
    }
    Ok(())
}

async fn rollback(store: &dyn DocumentStore, created: &[String]) {
    for name in created {
        if let Err(err) = store.drop_collection(name).await {
            event!(Level::WARN, error = %err, shard = %name, "rollback could not drop shard");
        }
        if let Err(err) = store.delete(METADATA_COLLECTION, &Filter::by_id(name.clone())).await {
            event!(Level::WARN, error = %err, shard = %name, "rollback could not delete metadata");
        }
    }
}
