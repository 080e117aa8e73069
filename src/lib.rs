//! # Agent-Pool Control Plane
//!
//! A control plane for elastic worker pools ("teams" of agents) that keeps
//! each pool correctly sized against its workload and automatically recovers
//! individual agents from failure.
//!
//! ## Architecture Overview
//!
//! The crate is organized into three layers:
//!
//! - [`core`]: the auto-scaler: policy evaluation, predictive scaling,
//!   budget enforcement, and the evaluation loop that drives the external
//!   orchestrator
//! - [`healing`]: the self-healing controller: liveness supervision,
//!   circuit-gated recovery, escalation
//! - [`infrastructure`]: shared services: circuit breakers, checkpointing,
//!   the durable store, and the metrics cache
//! - [`utils`]: configuration, error types, and logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agentpool::core::{AutoScaler, CostTracker, PredictiveScaler, ScalingPolicy};
//! use agentpool::infrastructure::{Cache, ControlStore};
//! use agentpool::utils::ControlPlaneConfig;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # use agentpool::core::{CacheMetricsSource, MetricsSource, Orchestrator};
//! # async fn example(orchestrator: Arc<dyn Orchestrator>) -> agentpool::utils::PoolResult<()> {
//! let config = ControlPlaneConfig::default();
//! let store = ControlStore::open("agentpool.db").await?;
//! let metrics_cache = Arc::new(Cache::new(Duration::from_secs(300), 10_000));
//! let snapshots = Arc::new(Cache::new(Duration::from_secs(300), 10_000));
//!
//! let scaler = AutoScaler::new(
//!     config.autoscaler.clone(),
//!     Arc::new(CacheMetricsSource::new(metrics_cache)),
//!     orchestrator,
//!     Arc::new(CostTracker::new(config.autoscaler.cost_tracking.clone())),
//!     Arc::new(PredictiveScaler::new(config.autoscaler.predictive.clone())),
//!     snapshots,
//!     Some(store),
//! )?;
//! scaler.register_policy(ScalingPolicy::with_defaults("team-a", 2, 20)).await?;
//! scaler.start().await;
//! # Ok(())
//! # }
//! ```

/// Auto-scaling: policies, evaluation, prediction, budgets
pub mod core;
/// Self-healing: failure detection, recovery, escalation
pub mod healing;
/// Shared infrastructure: circuits, checkpoints, persistence, caching
pub mod infrastructure;
/// Configuration, errors, and logging
pub mod utils;

#[cfg(test)]
mod tests;

pub use crate::core::{AutoScaler, CostTracker, Orchestrator, PredictiveScaler, ScalingPolicy};
pub use crate::healing::{AgentRecoveryHandler, SelfHealingController};
pub use crate::infrastructure::{CheckpointManager, CircuitBreaker, CircuitRegistry, ControlStore};
pub use crate::utils::{ControlPlaneConfig, PoolError, PoolResult};
