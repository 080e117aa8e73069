/// TTL key-value cache backing the metrics surface
pub mod cache;
/// Snapshot and restore for named entities
pub mod checkpoint;
/// Failure-aware gating of outbound calls
pub mod circuit_breaker;
/// SQLite-backed durable store
pub mod persistence;

pub use cache::{Cache, MetricsCache, SnapshotCache};
pub use checkpoint::{
    Checkpoint, CheckpointEvent, CheckpointManager, CheckpointProvider, RestoreOutcome,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitEvent, CircuitMetrics, CircuitRegistry, CircuitState,
};
pub use persistence::ControlStore;
