// ============================================================================
// docshard Library
// ============================================================================
//
// Shard-aware data access for document collections: deterministic placement
// (hash or range), scatter-gather queries and aggregations, online
// rebalancing and dynamic shard-count changes.

pub mod core;
pub mod config;
pub mod resolver;
pub mod backend;
pub mod routing_cache;
pub mod registry;
pub mod store;
pub mod rebalance;
pub mod topology;

// Re-export main types for convenience
pub use crate::core::{
    Accumulator, Condition, Document, Filter, FindOptions, GroupKey, GroupStage, ID_FIELD,
    Operand, Result, ShardError, ShardFailure, SortDirection, SortKey, Stage, UpdateSpec, Value,
};
pub use config::{IndexSpec, RetryPolicy, ShardStrategy, ShardingConfig, ShardingPolicy};

// Collaborators and their in-memory implementations
pub use backend::{
    BroadcastEventBus, CacheBackend, DocumentStore, EventBus, FailureMode, InMemoryCache,
    InMemoryDocumentStore, ShardingEvent, ShardingEventKind,
};

// Sharding components
pub use registry::{ShardHandle, ShardLayout, ShardMetadata, ShardRegistry, ShardStatus};
pub use routing_cache::RoutingCache;
pub use store::ShardedStore;
pub use rebalance::{
    MigrationTask, RebalanceCoordinator, RebalanceReport, RebalanceState, ShardLoadSample,
};
pub use topology::{ShardTopologyManager, ShardingStatus, TopologyChangeReport};
