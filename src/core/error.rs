use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One failed branch of a multi-shard operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardFailure {
    pub shard_index: usize,
    pub shard_name: String,
    pub error: String,
}

impl fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard {} ({}): {}", self.shard_index, self.shard_name, self.error)
    }
}

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("Invalid sharding config: {0}")]
    InvalidConfig(String),

    #[error("Shard provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("Shard unavailable: {0}")]
    ShardUnavailable(String),

    #[error("Shard key value {value} precedes the first range boundary {first_boundary}")]
    OutOfRange {
        value: String,
        first_boundary: String,
    },

    #[error("Document is missing shard key '{0}'")]
    MissingShardKey(String),

    #[error("Partial failure in {operation}: {succeeded} shard(s) succeeded, failed: {}", format_failures(.failures))]
    PartialFailure {
        operation: String,
        failures: Vec<ShardFailure>,
        succeeded: usize,
    },

    #[error("Migration failed on task {task} after {completed_tasks} completed task(s): {reason}")]
    MigrationFailed {
        task: String,
        completed_tasks: usize,
        reason: String,
    },

    #[error("Shard '{shard}': {source}")]
    Shard {
        shard: String,
        #[source]
        source: Box<ShardError>,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("Collection '{0}' already exists")]
    CollectionExists(String),

    #[error("Collection '{0}' is not sharded")]
    NotSharded(String),

    #[error("Collection '{0}' is already sharded")]
    AlreadySharded(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Event bus error: {0}")]
    Event(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, ShardError>;

impl ShardError {
    /// Wraps an error with the name of the shard it came from.
    pub fn on_shard(self, shard: impl Into<String>) -> Self {
        match self {
            already @ ShardError::Shard { .. } => already,
            other => ShardError::Shard {
                shard: shard.into(),
                source: Box::new(other),
            },
        }
    }

    /// Strips shard context wrappers.
    pub fn root(&self) -> &ShardError {
        match self {
            ShardError::Shard { source, .. } => source.root(),
            other => other,
        }
    }

    /// Transient errors a caller may retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            ShardError::ShardUnavailable(_) | ShardError::Timeout(_)
        )
    }
}

fn format_failures(failures: &[ShardFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl<T> From<std::sync::PoisonError<T>> for ShardError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for ShardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_context_wraps_once_and_keeps_retryability() {
        let err = ShardError::ShardUnavailable("slot 2".to_string())
            .on_shard("orders_shard_2")
            .on_shard("orders_shard_9");

        match &err {
            ShardError::Shard { shard, .. } => assert_eq!(shard, "orders_shard_2"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());
        assert!(!ShardError::InvalidConfig("x".into()).is_retryable());
    }

    #[test]
    fn partial_failure_lists_every_failed_shard() {
        let err = ShardError::PartialFailure {
            operation: "delete".to_string(),
            failures: vec![
                ShardFailure {
                    shard_index: 1,
                    shard_name: "users_shard_1".to_string(),
                    error: "boom".to_string(),
                },
                ShardFailure {
                    shard_index: 3,
                    shard_name: "users_shard_3".to_string(),
                    error: "down".to_string(),
                },
            ],
            succeeded: 2,
        };
        let message = err.to_string();
        assert!(message.contains("shard 1 (users_shard_1): boom"));
        assert!(message.contains("shard 3 (users_shard_3): down"));
    }
}
