use crate::config::{IndexSpec, ShardStrategy};
use crate::core::{Document, Result, ShardError, Value, ID_FIELD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved collection holding one metadata row per physical shard.
pub const METADATA_COLLECTION: &str = "__shard_metadata";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Active,
    Draining,
    Retired,
}

impl ShardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStatus::Active => "active",
            ShardStatus::Draining => "draining",
            ShardStatus::Retired => "retired",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "active" => Ok(ShardStatus::Active),
            "draining" => Ok(ShardStatus::Draining),
            "retired" => Ok(ShardStatus::Retired),
            other => Err(ShardError::Serialization(format!(
                "unknown shard status '{}'",
                other
            ))),
        }
    }

    /// Lifecycle only moves forward: active -> draining -> retired.
    pub fn can_transition_to(&self, next: ShardStatus) -> bool {
        matches!(
            (self, next),
            (ShardStatus::Active, ShardStatus::Draining)
                | (ShardStatus::Draining, ShardStatus::Retired)
        )
    }
}

/// Durable description of one physical shard.
///
/// The rows of a collection carry enough to rebuild its `ShardingConfig`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub collection: String,
    pub shard_name: String,
    pub shard_index: usize,
    pub range_start: Option<Value>,
    pub range_end: Option<Value>,
    pub status: ShardStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub shard_key: String,
    pub strategy: ShardStrategy,
    pub indexes: Vec<IndexSpec>,
    pub generation: u64,
}

impl ShardMetadata {
    pub fn transition(&mut self, next: ShardStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ShardError::InvalidConfig(format!(
                "shard '{}' cannot move from {} to {}",
                self.shard_name,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn to_document(&self) -> Result<Document> {
        Ok(Document::new()
            .with(ID_FIELD, self.shard_name.clone())
            .with("collection", self.collection.clone())
            .with("shard_name", self.shard_name.clone())
            .with("shard_index", self.shard_index as i64)
            .with("range_start", self.range_start.clone().unwrap_or(Value::Null))
            .with("range_end", self.range_end.clone().unwrap_or(Value::Null))
            .with("status", self.status.as_str())
            .with("created_at", self.created_at.to_rfc3339())
            .with("updated_at", self.updated_at.to_rfc3339())
            .with("shard_key", self.shard_key.clone())
            .with("strategy", self.strategy.as_str())
            .with("indexes", serde_json::to_string(&self.indexes)?)
            .with("generation", self.generation))
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        Ok(Self {
            collection: text(doc, "collection")?,
            shard_name: text(doc, "shard_name")?,
            shard_index: integer(doc, "shard_index")? as usize,
            range_start: optional(doc, "range_start"),
            range_end: optional(doc, "range_end"),
            status: ShardStatus::parse(&text(doc, "status")?)?,
            created_at: timestamp(doc, "created_at")?,
            updated_at: timestamp(doc, "updated_at")?,
            shard_key: text(doc, "shard_key")?,
            strategy: ShardStrategy::parse(&text(doc, "strategy")?)?,
            indexes: serde_json::from_str(&text(doc, "indexes")?)?,
            generation: integer(doc, "generation")? as u64,
        })
    }
}

fn text(doc: &Document, field: &str) -> Result<String> {
    doc.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ShardError::Serialization(format!("metadata field '{}' missing", field)))
}

fn integer(doc: &Document, field: &str) -> Result<i64> {
    doc.get(field)
        .and_then(Value::as_i64)
        .filter(|v| *v >= 0)
        .ok_or_else(|| ShardError::Serialization(format!("metadata field '{}' missing", field)))
}

fn optional(doc: &Document, field: &str) -> Option<Value> {
    doc.get(field).filter(|v| !v.is_null()).cloned()
}

fn timestamp(doc: &Document, field: &str) -> Result<DateTime<Utc>> {
    let raw = text(doc, field)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| ShardError::Serialization(format!("metadata field '{}': {}", field, err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ShardMetadata {
        let now = Utc::now();
        ShardMetadata {
            collection: "events".to_string(),
            shard_name: "events_shard_1".to_string(),
            shard_index: 1,
            range_start: Some(Value::Integer(100)),
            range_end: None,
            status: ShardStatus::Active,
            created_at: now,
            updated_at: now,
            shard_key: "ts".to_string(),
            strategy: ShardStrategy::Range,
            indexes: vec![IndexSpec::on(&["ts"])],
            generation: 3,
        }
    }

    #[test]
    fn metadata_rows_survive_document_encoding() {
        let meta = sample();
        let doc = meta.to_document().unwrap();
        assert_eq!(doc.id(), Some("events_shard_1"));
        let decoded = ShardMetadata::from_document(&doc).unwrap();
        assert_eq!(decoded.shard_index, 1);
        assert_eq!(decoded.range_start, Some(Value::Integer(100)));
        assert_eq!(decoded.range_end, None);
        assert_eq!(decoded.strategy, ShardStrategy::Range);
        assert_eq!(decoded.indexes, meta.indexes);
        assert_eq!(decoded.generation, 3);
        assert_eq!(decoded.created_at.timestamp(), meta.created_at.timestamp());
    }

    #[test]
    fn status_only_moves_forward() {
        let mut meta = sample();
        assert!(meta.transition(ShardStatus::Retired).is_err());
        meta.transition(ShardStatus::Draining).unwrap();
        meta.transition(ShardStatus::Retired).unwrap();
        assert!(meta.transition(ShardStatus::Active).is_err());
    }
}
