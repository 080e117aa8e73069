use crate::utils::error::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

/// Top-level configuration for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ControlPlaneConfig {
    pub autoscaler: AutoScalerConfig,
    pub healing: SelfHealingConfig,
    pub checkpoints: CheckpointConfig,
    pub logging: LoggingConfig,
}

/// Auto-scaler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AutoScalerConfig {
    pub evaluation_interval_seconds: u64,
    pub max_scaling_operations_per_hour: u32,
    pub default_policy: DefaultPolicyConfig,
    pub predictive: PredictiveConfig,
    pub cost_tracking: CostTrackingConfig,
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DefaultPolicyConfig {
    pub min_agents: u32,
    pub max_agents: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PredictiveConfig {
    pub enabled: bool,
    /// Horizon used when projecting queue depth, in minutes
    pub lead_time_minutes: u64,
    pub pre_warm: PreWarmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PreWarmConfig {
    pub enabled: bool,
    pub agent_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CostTrackingConfig {
    pub cost_per_agent_hour: f64,
    pub overhead_cost_per_hour: f64,
    pub currency: String,
}

/// Self-healing controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SelfHealingConfig {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub use_checkpoints: bool,
    pub enable_escalation: bool,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Checkpoint manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub max_checkpoints_per_entity: usize,
    pub max_age_hours: Option<u64>,
    pub compression_enabled: bool,
}

/// Per-circuit configuration; applied on first creation of a named circuit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub success_threshold: u32,
    pub reset_timeout_ms: u64,
    pub monitoring_window_ms: u64,
    pub half_open_max_calls: u32,
    pub auto_recovery: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            autoscaler: AutoScalerConfig::default(),
            healing: SelfHealingConfig::default(),
            checkpoints: CheckpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_seconds: 30,
            max_scaling_operations_per_hour: 20,
            default_policy: DefaultPolicyConfig::default(),
            predictive: PredictiveConfig::default(),
            cost_tracking: CostTrackingConfig::default(),
            debug: false,
        }
    }
}

impl Default for DefaultPolicyConfig {
    fn default() -> Self {
        Self {
            min_agents: 1,
            max_agents: 20,
        }
    }
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lead_time_minutes: 5,
            pre_warm: PreWarmConfig::default(),
        }
    }
}

impl Default for PreWarmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            agent_count: 2,
        }
    }
}

impl Default for CostTrackingConfig {
    fn default() -> Self {
        Self {
            cost_per_agent_hour: 0.5,
            overhead_cost_per_hour: 0.0,
            currency: "USD".to_string(),
        }
    }
}

impl Default for SelfHealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 5_000,
            use_checkpoints: true,
            enable_escalation: true,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
            max_checkpoints_per_entity: 10,
            max_age_hours: Some(24),
            compression_enabled: false,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout_ms: 60_000,
            monitoring_window_ms: 60_000,
            half_open_max_calls: 3,
            auto_recovery: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ControlPlaneConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> PoolResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PoolError::ConfigurationFileNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path).map_err(|e| PoolError::ConfigurationError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        let mut config: Self =
            toml::from_str(&contents).map_err(|e| PoolError::ConfigurationError {
                reason: format!("failed to parse {}: {e}", path.display()),
            })?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables override file values for deploy-time knobs.
    fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("AGENTPOOL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(interval) = env::var("AGENTPOOL_EVALUATION_INTERVAL_SECONDS") {
            if let Ok(parsed) = interval.parse() {
                self.autoscaler.evaluation_interval_seconds = parsed;
            }
        }
        if let Ok(interval) = env::var("AGENTPOOL_CHECK_INTERVAL_MS") {
            if let Ok(parsed) = interval.parse() {
                self.healing.check_interval_ms = parsed;
            }
        }
    }

    pub fn validate(&self) -> PoolResult<()> {
        self.autoscaler.validate()?;
        self.healing.validate()?;
        self.checkpoints.validate()?;
        Ok(())
    }
}

impl AutoScalerConfig {
    pub fn validate(&self) -> PoolResult<()> {
        if self.evaluation_interval_seconds == 0 {
            return Err(PoolError::ConfigurationError {
                reason: "evaluation_interval_seconds must be positive".to_string(),
            });
        }
        if self.default_policy.min_agents > self.default_policy.max_agents {
            return Err(PoolError::ConfigurationError {
                reason: format!(
                    "default_policy.min_agents ({}) exceeds max_agents ({})",
                    self.default_policy.min_agents, self.default_policy.max_agents
                ),
            });
        }
        if self.cost_tracking.cost_per_agent_hour < 0.0
            || self.cost_tracking.overhead_cost_per_hour < 0.0
        {
            return Err(PoolError::ConfigurationError {
                reason: "cost rates must be non-negative".to_string(),
            });
        }
        Ok(())
    }
}

impl SelfHealingConfig {
    pub fn validate(&self) -> PoolResult<()> {
        if self.check_interval_ms == 0 {
            return Err(PoolError::ConfigurationError {
                reason: "check_interval_ms must be positive".to_string(),
            });
        }
        if self.max_retries == 0 {
            return Err(PoolError::ConfigurationError {
                reason: "max_retries must be at least 1".to_string(),
            });
        }
        self.circuit_breaker.validate()
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> PoolResult<()> {
        if self.enabled && self.interval_ms == 0 {
            return Err(PoolError::ConfigurationError {
                reason: "interval_ms must be positive when checkpoints are enabled".to_string(),
            });
        }
        if self.max_checkpoints_per_entity == 0 {
            return Err(PoolError::ConfigurationError {
                reason: "max_checkpoints_per_entity must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> PoolResult<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(PoolError::ConfigurationError {
                reason: "circuit breaker thresholds must be at least 1".to_string(),
            });
        }
        if self.monitoring_window_ms == 0 {
            return Err(PoolError::ConfigurationError {
                reason: "monitoring_window_ms must be positive".to_string(),
            });
        }
        Ok(())
    }
}
