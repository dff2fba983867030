use super::DocumentStore;
use crate::config::IndexSpec;
use crate::core::{
    compare_documents, run_pipeline, Document, Filter, FindOptions, Result, ShardError, Stage,
    UpdateSpec, Value, ID_FIELD,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

/// Injected failure for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Every operation fails with `ShardUnavailable`.
    All,
    /// Only mutations fail; reads still succeed.
    Writes,
}

// Kind-qualified `_id`, so `1` and `"1"` are different documents.
fn storage_key(doc: &mut Document) -> String {
    doc.ensure_id();
    doc.identity_key().unwrap_or_default()
}

#[derive(Default)]
struct MemoryCollection {
    /// Documents keyed by the kind-qualified `_id`.
    docs: BTreeMap<String, Document>,
    indexes: Vec<IndexSpec>,
}

impl MemoryCollection {
    fn check_unique(&self, doc: &Document, replacing: Option<&str>) -> Result<()> {
        for index in self.indexes.iter().filter(|index| index.unique) {
            let key: Vec<Value> = index
                .fields
                .iter()
                .map(|f| doc.get(f).cloned().unwrap_or(Value::Null))
                .collect();
            let clash = self.docs.iter().any(|(id, existing)| {
                Some(id.as_str()) != replacing
                    && index
                        .fields
                        .iter()
                        .zip(key.iter())
                        .all(|(f, v)| existing.get(f).unwrap_or(&Value::Null) == v)
            });
            if clash {
                return Err(ShardError::Store(format!(
                    "unique index '{}' violated",
                    index.index_name()
                )));
            }
        }
        Ok(())
    }

    fn insert(&mut self, mut doc: Document) -> Result<Document> {
        let key = storage_key(&mut doc);
        if self.docs.contains_key(&key) {
            return Err(ShardError::Store(format!("duplicate _id '{}'", key)));
        }
        self.check_unique(&doc, None)?;
        self.docs.insert(key, doc.clone());
        Ok(doc)
    }
}

/// In-memory `DocumentStore`.
///
/// Collections are independently locked so shards never contend with each other.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Arc<RwLock<MemoryCollection>>>>,
    failures: Mutex<HashMap<String, FailureMode>>,
    touches: Mutex<HashMap<String, u64>>,
    latencies: Mutex<HashMap<String, Duration>>,
    operations: AtomicU64,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Makes operations on `name` fail until `heal` is called.
    pub fn inject_failure(&self, name: &str, mode: FailureMode) -> Result<()> {
        self.failures.lock()?.insert(name.to_string(), mode);
        Ok(())
    }

    pub fn heal(&self, name: &str) -> Result<()> {
        self.failures.lock()?.remove(name);
        Ok(())
    }

    /// Delays every operation on `name`. A zero delay clears it.
    pub fn set_latency(&self, name: &str, delay: Duration) -> Result<()> {
        let mut latencies = self.latencies.lock()?;
        if delay.is_zero() {
            latencies.remove(name);
        } else {
            latencies.insert(name.to_string(), delay);
        }
        Ok(())
    }

    /// Number of query/mutation calls that reached `name` since the last reset.
    pub fn touches(&self, name: &str) -> u64 {
        self.touches
            .lock()
            .map(|t| t.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn reset_touches(&self) {
        if let Ok(mut touches) = self.touches.lock() {
            touches.clear();
        }
    }

    pub fn operation_count(&self) -> u64 {
        self.operations.load(AtomicOrdering::Relaxed)
    }

    pub async fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn guard(&self, name: &str, mutation: bool) -> Result<()> {
        self.operations.fetch_add(1, AtomicOrdering::Relaxed);
        *self.touches.lock()?.entry(name.to_string()).or_insert(0) += 1;
        match self.failures.lock()?.get(name) {
            Some(FailureMode::All) => Err(ShardError::ShardUnavailable(format!(
                "collection '{}' is unavailable",
                name
            ))),
            Some(FailureMode::Writes) if mutation => Err(ShardError::ShardUnavailable(format!(
                "collection '{}' rejects writes",
                name
            ))),
            _ => Ok(()),
        }
    }

    async fn enter(&self, name: &str, mutation: bool) -> Result<()> {
        self.guard(name, mutation)?;
        let delay = self.latencies.lock()?.get(name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn collection(&self, name: &str) -> Result<Arc<RwLock<MemoryCollection>>> {
        self.collections
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ShardError::CollectionNotFound(name.to_string()))
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn create_collection(&self, name: &str) -> Result<()> {
        self.enter(name, true).await?;
        let mut collections = self.collections.write().await;
        if collections.contains_key(name) {
            return Err(ShardError::CollectionExists(name.to_string()));
        }
        collections.insert(name.to_string(), Arc::new(RwLock::new(MemoryCollection::default())));
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> Result<()> {
        self.enter(name, true).await?;
        if self.collections.write().await.remove(name).is_none() {
            return Err(ShardError::CollectionNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.collections.read().await.contains_key(name))
    }

    async fn create_index(&self, name: &str, index: &IndexSpec) -> Result<()> {
        self.enter(name, true).await?;
        let handle = self.collection(name).await?;
        let mut collection = handle.write().await;
        if collection
            .indexes
            .iter()
            .any(|existing| existing.index_name() == index.index_name())
        {
            return Ok(());
        }
        collection.indexes.push(index.clone());
        Ok(())
    }

    async fn insert(&self, name: &str, doc: Document) -> Result<Document> {
        self.enter(name, true).await?;
        let handle = self.collection(name).await?;
        let mut collection = handle.write().await;
        collection.insert(doc)
    }

    async fn insert_many(&self, name: &str, docs: Vec<Document>) -> Result<Vec<Document>> {
        self.enter(name, true).await?;
        let handle = self.collection(name).await?;
        let mut collection = handle.write().await;

        // all-or-nothing within one collection
        let mut staged = Vec::with_capacity(docs.len());
        let mut seen = std::collections::HashSet::new();
        for mut doc in docs {
            let key = storage_key(&mut doc);
            if collection.docs.contains_key(&key) || !seen.insert(key.clone()) {
                return Err(ShardError::Store(format!("duplicate _id '{}'", key)));
            }
            collection.check_unique(&doc, None)?;
            staged.push((key, doc));
        }
        for (key, doc) in &staged {
            collection.docs.insert(key.clone(), doc.clone());
        }
        Ok(staged.into_iter().map(|(_, doc)| doc).collect())
    }

    async fn upsert(&self, name: &str, mut doc: Document) -> Result<()> {
        self.enter(name, true).await?;
        let handle = self.collection(name).await?;
        let mut collection = handle.write().await;
        let key = storage_key(&mut doc);
        collection.check_unique(&doc, Some(key.as_str()))?;
        collection.docs.insert(key, doc);
        Ok(())
    }

    async fn find(
        &self,
        name: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        self.enter(name, false).await?;
        let handle = self.collection(name).await?;
        let collection = handle.read().await;
        let mut matched: Vec<Document> = collection
            .docs
            .values()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect();
        if !options.sort.is_empty() {
            matched.sort_by(|a, b| compare_documents(a, b, &options.sort));
        }
        Ok(options.paginate(matched))
    }

    async fn update(&self, name: &str, filter: &Filter, update: &UpdateSpec) -> Result<u64> {
        self.enter(name, true).await?;
        if update.touches(ID_FIELD) {
            return Err(ShardError::InvalidUpdate("_id is immutable".to_string()));
        }
        let handle = self.collection(name).await?;
        let mut collection = handle.write().await;

        let mut changed = Vec::new();
        for (id, doc) in collection.docs.iter().filter(|(_, doc)| filter.matches(doc)) {
            let mut next = doc.clone();
            if update.apply(&mut next)? {
                changed.push((id.clone(), next));
            }
        }
        for (id, next) in &changed {
            collection.check_unique(next, Some(id.as_str()))?;
        }
        let modified = changed.len() as u64;
        for (id, next) in changed {
            collection.docs.insert(id, next);
        }
        Ok(modified)
    }

    async fn delete(&self, name: &str, filter: &Filter) -> Result<u64> {
        self.enter(name, true).await?;
        let handle = self.collection(name).await?;
        let mut collection = handle.write().await;
        let before = collection.docs.len();
        collection.docs.retain(|_, doc| !filter.matches(doc));
        Ok((before - collection.docs.len()) as u64)
    }

    async fn aggregate(&self, name: &str, pipeline: &[Stage]) -> Result<Vec<Document>> {
        self.enter(name, false).await?;
        let handle = self.collection(name).await?;
        let docs: Vec<Document> = handle.read().await.docs.values().cloned().collect();
        run_pipeline(docs, pipeline)
    }

    async fn count(&self, name: &str, filter: &Filter) -> Result<u64> {
        self.enter(name, false).await?;
        let handle = self.collection(name).await?;
        let collection = handle.read().await;
        Ok(collection.docs.values().filter(|d| filter.matches(d)).count() as u64)
    }

    async fn collection_size_bytes(&self, name: &str) -> Result<u64> {
        self.enter(name, false).await?;
        let handle = self.collection(name).await?;
        let collection = handle.read().await;
        Ok(collection
            .docs
            .values()
            .map(|doc| doc.encoded_len() as u64)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SortKey;

    #[tokio::test]
    async fn crud_round_trip_on_one_collection() {
        let store = InMemoryDocumentStore::new();
        store.create_collection("people").await.unwrap();

        let ada = store
            .insert("people", Document::new().with("name", "Ada").with("age", 36))
            .await
            .unwrap();
        assert!(ada.id().is_some());
        store
            .insert_many(
                "people",
                vec![
                    Document::new().with("name", "Bob").with("age", 25),
                    Document::new().with("name", "Cy").with("age", 51),
                ],
            )
            .await
            .unwrap();

        let adults = store
            .find(
                "people",
                &Filter::all().gte("age", 30),
                &FindOptions::new().sort(SortKey::desc("age")),
            )
            .await
            .unwrap();
        let names: Vec<&str> = adults
            .iter()
            .filter_map(|d| d.get("name").and_then(Value::as_str))
            .collect();
        assert_eq!(names, vec!["Cy", "Ada"]);

        let modified = store
            .update("people", &Filter::all().eq("name", "Bob"), &UpdateSpec::new().inc("age", 1))
            .await
            .unwrap();
        assert_eq!(modified, 1);
        assert_eq!(store.delete("people", &Filter::all().lt("age", 40)).await.unwrap(), 2);
        assert_eq!(store.count("people", &Filter::all()).await.unwrap(), 1);
        assert!(store.collection_size_bytes("people").await.unwrap() > 0);
    }

    #[tokio::test]
    async fn duplicate_ids_and_unique_indexes_are_rejected() {
        let store = InMemoryDocumentStore::new();
        store.create_collection("c").await.unwrap();
        store.create_index("c", &IndexSpec::on(&["email"]).unique()).await.unwrap();

        store
            .insert("c", Document::new().with("_id", "1").with("email", "a@x"))
            .await
            .unwrap();
        assert!(store.insert("c", Document::new().with("_id", "1")).await.is_err());
        assert!(store
            .insert("c", Document::new().with("_id", "2").with("email", "a@x"))
            .await
            .is_err());

        // upsert replaces in place without tripping the unique index on itself
        store
            .upsert("c", Document::new().with("_id", "1").with("email", "a@x").with("v", 2))
            .await
            .unwrap();
        assert_eq!(store.count("c", &Filter::all()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_unavailable() {
        let store = InMemoryDocumentStore::new();
        store.create_collection("c").await.unwrap();
        store.inject_failure("c", FailureMode::Writes).unwrap();

        assert!(store.find("c", &Filter::all(), &FindOptions::new()).await.is_ok());
        let err = store.insert("c", Document::new()).await.unwrap_err();
        assert!(err.is_retryable());

        store.heal("c").unwrap();
        assert!(store.insert("c", Document::new()).await.is_ok());
        assert!(store.touches("c") >= 3);
    }

    #[tokio::test]
    async fn ids_of_every_kind_are_stored_and_kept_apart() {
        let store = InMemoryDocumentStore::new();
        store.create_collection("c").await.unwrap();

        let stored = store
            .insert_many(
                "c",
                vec![
                    Document::new().with("_id", 1).with("v", "int"),
                    Document::new().with("_id", "1").with("v", "text"),
                    Document::new().with("_id", 2),
                    Document::new().with("v", "generated"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(stored.len(), 4);
        assert_eq!(store.count("c", &Filter::all()).await.unwrap(), 4);

        let int_one = store
            .find("c", &Filter::all().eq("_id", 1), &FindOptions::new())
            .await
            .unwrap();
        assert_eq!(int_one.len(), 1);
        assert_eq!(int_one[0].get("v"), Some(&Value::from("int")));

        // upsert of the integer id leaves the text id alone
        store
            .upsert("c", Document::new().with("_id", 1).with("v", "replaced"))
            .await
            .unwrap();
        let text_one = store
            .find("c", &Filter::all().eq("_id", "1"), &FindOptions::new())
            .await
            .unwrap();
        assert_eq!(text_one[0].get("v"), Some(&Value::from("text")));
        assert!(store.insert("c", Document::new().with("_id", 2)).await.is_err());
        assert_eq!(store.count("c", &Filter::all()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn latency_delays_operations_until_cleared() {
        let store = InMemoryDocumentStore::new();
        store.create_collection("c").await.unwrap();
        store.set_latency("c", Duration::from_millis(30)).unwrap();

        let started = std::time::Instant::now();
        store.count("c", &Filter::all()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));

        store.set_latency("c", Duration::ZERO).unwrap();
        let started = std::time::Instant::now();
        store.count("c", &Filter::all()).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(30));
    }
}
