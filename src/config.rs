use crate::core::{Result, ShardError, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;

/// Placement strategy for a sharded collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStrategy {
    Hash,
    Range,
}

impl ShardStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardStrategy::Hash => "hash",
            ShardStrategy::Range => "range",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "hash" => Ok(ShardStrategy::Hash),
            "range" => Ok(ShardStrategy::Range),
            other => Err(ShardError::InvalidConfig(format!(
                "unknown shard strategy '{}'",
                other
            ))),
        }
    }
}

/// Index created on every shard of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub name: Option<String>,
}

impl IndexSpec {
    pub fn on(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: false,
            name: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn index_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("idx_{}", self.fields.join("_")))
    }
}

/// Sharding configuration of one collection.
///
/// Immutable after initialization except for `shard_count` (and, for range
/// collections, the boundary list that must track it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingConfig {
    pub shard_key: String,
    pub strategy: ShardStrategy,
    pub shard_count: usize,
    /// Lower boundary of each range; required iff `strategy` is `range`.
    #[serde(default)]
    pub ranges: Vec<Value>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl ShardingConfig {
    pub fn hash(shard_key: impl Into<String>, shard_count: usize) -> Self {
        Self {
            shard_key: shard_key.into(),
            strategy: ShardStrategy::Hash,
            shard_count,
            ranges: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Range configuration with one shard per lower boundary; the last range is open-ended.
    pub fn range<V: Into<Value>>(
        shard_key: impl Into<String>,
        boundaries: impl IntoIterator<Item = V>,
    ) -> Self {
        let ranges: Vec<Value> = boundaries.into_iter().map(Into::into).collect();
        Self {
            shard_key: shard_key.into(),
            strategy: ShardStrategy::Range,
            shard_count: ranges.len(),
            ranges,
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_key.trim().is_empty() {
            return Err(ShardError::InvalidConfig(
                "shard_key must not be empty".to_string(),
            ));
        }
        if self.shard_count == 0 {
            return Err(ShardError::InvalidConfig(
                "shard_count must be >= 1".to_string(),
            ));
        }

        match self.strategy {
            ShardStrategy::Hash => {
                if !self.ranges.is_empty() {
                    return Err(ShardError::InvalidConfig(
                        "ranges are only allowed with the range strategy".to_string(),
                    ));
                }
            }
            ShardStrategy::Range => validate_ranges(&self.ranges, self.shard_count)?,
        }

        for index in &self.indexes {
            if index.fields.is_empty() || index.fields.iter().any(|f| f.trim().is_empty()) {
                return Err(ShardError::InvalidConfig(format!(
                    "index '{}' must name at least one non-empty field",
                    index.index_name()
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_ranges(ranges: &[Value], shard_count: usize) -> Result<()> {
    if ranges.len() != shard_count {
        return Err(ShardError::InvalidConfig(format!(
            "range strategy needs exactly {} boundaries, got {}",
            shard_count,
            ranges.len()
        )));
    }
    if let Some(null_at) = ranges.iter().position(Value::is_null) {
        return Err(ShardError::InvalidConfig(format!(
            "range boundary {} must not be null",
            null_at
        )));
    }
    for (i, pair) in ranges.windows(2).enumerate() {
        let ord = pair[0].compare(&pair[1]).map_err(|err| {
            ShardError::InvalidConfig(format!("range boundaries {} and {}: {}", i, i + 1, err))
        })?;
        if ord == Ordering::Greater {
            return Err(ShardError::InvalidConfig(format!(
                "range boundaries must be non-decreasing: {} > {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

/// Bounded retry for transient shard errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 25,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }
}

/// Runtime tuning for the sharded data-access layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingPolicy {
    /// Rebalancing runs only when `(max(load) - mean) / mean` exceeds this.
    pub imbalance_threshold: f64,
    /// Shards above `source_tolerance * mean` load are migration sources.
    pub source_tolerance: f64,
    /// Shards below `target_tolerance * mean` load are migration targets.
    pub target_tolerance: f64,
    /// Documents read from a source shard per migration batch.
    pub migration_batch_size: usize,
    /// Routing cache entry TTL in seconds.
    pub routing_cache_ttl_secs: u64,
    /// Upper bound for scatter-gather fan-out, if any.
    pub scatter_timeout_ms: Option<u64>,
    pub insert_retry: RetryPolicy,
}

impl Default for ShardingPolicy {
    fn default() -> Self {
        Self {
            imbalance_threshold: 0.2,
            source_tolerance: 1.1,
            target_tolerance: 0.9,
            migration_batch_size: 100,
            routing_cache_ttl_secs: 300,
            scatter_timeout_ms: None,
            insert_retry: RetryPolicy::default(),
        }
    }
}

impl ShardingPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the imbalance threshold
    pub fn imbalance_threshold(mut self, threshold: f64) -> Self {
        self.imbalance_threshold = threshold;
        self
    }

    /// Set source/target load tolerances
    pub fn tolerances(mut self, source: f64, target: f64) -> Self {
        self.source_tolerance = source;
        self.target_tolerance = target;
        self
    }

    /// Set migration batch size
    pub fn migration_batch_size(mut self, size: usize) -> Self {
        self.migration_batch_size = size;
        self
    }

    /// Set routing cache TTL
    pub fn routing_cache_ttl(mut self, ttl: Duration) -> Self {
        self.routing_cache_ttl_secs = ttl.as_secs();
        self
    }

    /// Set scatter timeout
    pub fn scatter_timeout(mut self, timeout: Duration) -> Self {
        self.scatter_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set insert retry policy
    pub fn insert_retry(mut self, retry: RetryPolicy) -> Self {
        self.insert_retry = retry;
        self
    }

    pub fn routing_cache_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.routing_cache_ttl_secs)
    }

    pub fn scatter_timeout_duration(&self) -> Option<Duration> {
        self.scatter_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.imbalance_threshold.is_finite() && self.imbalance_threshold >= 0.0) {
            return Err(ShardError::InvalidConfig(
                "imbalance_threshold must be a non-negative number".to_string(),
            ));
        }
        if !(self.source_tolerance >= 1.0 && self.target_tolerance <= 1.0) {
            return Err(ShardError::InvalidConfig(
                "source_tolerance must be >= 1.0 and target_tolerance <= 1.0".to_string(),
            ));
        }
        if self.target_tolerance < 0.0 {
            return Err(ShardError::InvalidConfig(
                "target_tolerance must not be negative".to_string(),
            ));
        }
        if self.migration_batch_size == 0 {
            return Err(ShardError::InvalidConfig(
                "migration_batch_size must be > 0".to_string(),
            ));
        }
        if self.insert_retry.max_attempts == 0 {
            return Err(ShardError::InvalidConfig(
                "insert_retry.max_attempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_config_rejects_empty_key_and_zero_shards() {
        assert!(ShardingConfig::hash("user_id", 4).validate().is_ok());
        assert!(ShardingConfig::hash("  ", 4).validate().is_err());
        assert!(ShardingConfig::hash("user_id", 0).validate().is_err());

        let mut with_ranges = ShardingConfig::hash("user_id", 1);
        with_ranges.ranges.push(Value::Integer(0));
        assert!(with_ranges.validate().is_err());
    }

    #[test]
    fn range_boundaries_must_match_count_and_not_decrease() {
        assert!(ShardingConfig::range("score", [0, 100, 200]).validate().is_ok());
        assert!(ShardingConfig::range("score", [0, 100, 100]).validate().is_ok());
        assert!(ShardingConfig::range("score", [0, 200, 100]).validate().is_err());

        let mut short = ShardingConfig::range("score", [0, 100]);
        short.shard_count = 3;
        assert!(short.validate().is_err());

        let mixed = ShardingConfig::range("score", vec![Value::Integer(0), Value::from("b")]);
        assert!(mixed.validate().is_err());
    }

    #[test]
    fn indexes_need_fields() {
        let bad = ShardingConfig::hash("k", 2).with_index(IndexSpec::on(&[]));
        assert!(bad.validate().is_err());
        let good = ShardingConfig::hash("k", 2).with_index(IndexSpec::on(&["k", "ts"]).unique());
        assert!(good.validate().is_ok());
        assert_eq!(good.indexes[0].index_name(), "idx_k_ts");
    }

    #[test]
    fn policy_defaults_match_reference_thresholds() {
        let policy = ShardingPolicy::default();
        assert_eq!(policy.imbalance_threshold, 0.2);
        assert_eq!(policy.source_tolerance, 1.1);
        assert_eq!(policy.target_tolerance, 0.9);
        assert!(policy.validate().is_ok());
        assert!(ShardingPolicy::new().migration_batch_size(0).validate().is_err());

        let parsed: ShardingPolicy =
            serde_json::from_str(r#"{"migration_batch_size": 10}"#).unwrap();
        assert_eq!(parsed.migration_batch_size, 10);
        assert_eq!(parsed.routing_cache_ttl_secs, 300);
    }

    #[test]
    fn retry_backoff_grows_exponentially() {
        let retry = RetryPolicy {
            max_attempts: 4,
            base_backoff_ms: 10,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(10));
        assert_eq!(retry.backoff(3), Duration::from_millis(40));
    }
}
