use super::EventBus;
use crate::core::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;

const HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardingEventKind {
    Initialized,
    ShardAdded,
    ShardRemoved,
    Rebalanced,
    MigrationStarted,
    MigrationCompleted,
    MigrationFailed,
}

impl ShardingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardingEventKind::Initialized => "sharding.initialized",
            ShardingEventKind::ShardAdded => "sharding.shard_added",
            ShardingEventKind::ShardRemoved => "sharding.shard_removed",
            ShardingEventKind::Rebalanced => "sharding.rebalanced",
            ShardingEventKind::MigrationStarted => "sharding.migration_started",
            ShardingEventKind::MigrationCompleted => "sharding.migration_completed",
            ShardingEventKind::MigrationFailed => "sharding.migration_failed",
        }
    }
}

/// A lifecycle notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingEvent {
    pub kind: ShardingEventKind,
    pub collection: String,
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

impl ShardingEvent {
    pub fn new(
        kind: ShardingEventKind,
        collection: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            collection: collection.into(),
            payload,
            emitted_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }
}

/// Fan-out event bus on a tokio broadcast channel.
///
/// Also keeps a bounded history so late observers can inspect what happened.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<ShardingEvent>,
    history: Mutex<Vec<ShardingEvent>>,
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShardingEvent> {
        self.sender.subscribe()
    }

    pub fn history(&self) -> Vec<ShardingEvent> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Names of recorded events, oldest first.
    pub fn event_names(&self) -> Vec<&'static str> {
        self.history().iter().map(ShardingEvent::name).collect()
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn emit(&self, event: ShardingEvent) -> Result<()> {
        {
            let mut history = self.history.lock()?;
            if history.len() >= HISTORY_LIMIT {
                history.remove(0);
            }
            history.push(event.clone());
        }
        // No subscribers is not a failure; the event is still in the history.
        let _ = self.sender.send(event);
        Ok(())
    }
}
