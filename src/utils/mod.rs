/// Typed configuration records for every component
pub mod config;
/// Error types and result alias
pub mod error;
/// Tracing subscriber setup
pub mod logging;

pub use config::{
    AutoScalerConfig, CheckpointConfig, CircuitBreakerConfig, ControlPlaneConfig,
    CostTrackingConfig, LoggingConfig, PredictiveConfig, SelfHealingConfig,
};
pub use error::{PoolError, PoolResult};
