//! Scaling policies and the decision record they produce.

use crate::utils::error::{PoolError, PoolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of metrics a threshold may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    QueueDepth,
    QueueGrowthRate,
    AgentCpuPercent,
    AgentMemoryPercent,
    EventBacklogSize,
    AgentUtilization,
    TaskCompletionRate,
}

impl MetricName {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueDepth => "queue_depth",
            Self::QueueGrowthRate => "queue_growth_rate",
            Self::AgentCpuPercent => "agent_cpu_percent",
            Self::AgentMemoryPercent => "agent_memory_percent",
            Self::EventBacklogSize => "event_backlog_size",
            Self::AgentUtilization => "agent_utilization",
            Self::TaskCompletionRate => "task_completion_rate",
        }
    }
}

impl std::fmt::Display for MetricName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl ThresholdOp {
    /// Compare an observed value against the threshold value.
    #[must_use]
    pub fn compare(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => observed > threshold,
            Self::Gte => observed >= threshold,
            Self::Lt => observed < threshold,
            Self::Lte => observed <= threshold,
            Self::Eq => (observed - threshold).abs() < f64::EPSILON,
        }
    }
}

/// One trigger condition inside a scaling rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricThreshold {
    pub metric: MetricName,
    pub op: ThresholdOp,
    pub value: f64,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}

/// Agents added or removed per scaling action: a fixed count, or derived
/// from queue depth at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepSize {
    Fixed(u32),
    Auto(AutoStep),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoStep {
    Auto,
}

impl StepSize {
    pub const AUTO: Self = Self::Auto(AutoStep::Auto);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleUpRule {
    pub thresholds: Vec<MetricThreshold>,
    pub increment: StepSize,
    pub max_increment: u32,
    pub cooldown_seconds: u64,
    pub require_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleDownRule {
    pub thresholds: Vec<MetricThreshold>,
    pub decrement: StepSize,
    pub max_decrement: u32,
    pub min_agents: u32,
    pub cooldown_seconds: u64,
    pub require_all: bool,
    pub graceful_shutdown: bool,
}

/// Per-team scaling policy. Registering replaces any prior policy for the
/// same team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub team_id: String,
    pub min_agents: u32,
    pub max_agents: u32,
    pub scale_up: ScaleUpRule,
    pub scale_down: ScaleDownRule,
    pub predictive: bool,
    pub cost_aware: bool,
}

impl ScalingPolicy {
    /// Baseline policy: scale up on queue pressure, down when the queue
    /// drains and agents idle.
    #[must_use]
    pub fn with_defaults(team_id: impl Into<String>, min_agents: u32, max_agents: u32) -> Self {
        Self {
            team_id: team_id.into(),
            min_agents,
            max_agents,
            scale_up: ScaleUpRule {
                thresholds: vec![
                    MetricThreshold {
                        metric: MetricName::QueueDepth,
                        op: ThresholdOp::Gt,
                        value: 10.0,
                        weight: 0.5,
                        duration_seconds: None,
                    },
                    MetricThreshold {
                        metric: MetricName::AgentUtilization,
                        op: ThresholdOp::Gt,
                        value: 0.8,
                        weight: 0.3,
                        duration_seconds: None,
                    },
                    MetricThreshold {
                        metric: MetricName::AgentCpuPercent,
                        op: ThresholdOp::Gt,
                        value: 80.0,
                        weight: 0.2,
                        duration_seconds: None,
                    },
                ],
                increment: StepSize::AUTO,
                max_increment: 5,
                cooldown_seconds: 300,
                require_all: false,
            },
            scale_down: ScaleDownRule {
                thresholds: vec![
                    MetricThreshold {
                        metric: MetricName::QueueDepth,
                        op: ThresholdOp::Lt,
                        value: 2.0,
                        weight: 0.6,
                        duration_seconds: None,
                    },
                    MetricThreshold {
                        metric: MetricName::AgentUtilization,
                        op: ThresholdOp::Lt,
                        value: 0.3,
                        weight: 0.4,
                        duration_seconds: None,
                    },
                ],
                decrement: StepSize::AUTO,
                max_decrement: 3,
                min_agents,
                cooldown_seconds: 600,
                require_all: false,
                graceful_shutdown: true,
            },
            predictive: false,
            cost_aware: true,
        }
    }

    /// Rejects policies that could never produce a valid decision.
    pub fn validate(&self) -> PoolResult<()> {
        if self.min_agents > self.max_agents {
            return Err(self.invalid(format!(
                "min_agents ({}) exceeds max_agents ({})",
                self.min_agents, self.max_agents
            )));
        }
        if self.scale_down.min_agents < self.min_agents {
            return Err(self.invalid(format!(
                "scale_down.min_agents ({}) below policy min_agents ({})",
                self.scale_down.min_agents, self.min_agents
            )));
        }
        Self::validate_thresholds(&self.scale_up.thresholds, self.scale_up.require_all)
            .map_err(|reason| self.invalid(format!("scale_up: {reason}")))?;
        Self::validate_thresholds(&self.scale_down.thresholds, self.scale_down.require_all)
            .map_err(|reason| self.invalid(format!("scale_down: {reason}")))?;
        Ok(())
    }

    fn validate_thresholds(thresholds: &[MetricThreshold], require_all: bool) -> Result<(), String> {
        let mut weight_sum = 0.0;
        for threshold in thresholds {
            if threshold.value < 0.0 {
                return Err(format!(
                    "negative threshold value for {}",
                    threshold.metric
                ));
            }
            if !(0.0..=1.0).contains(&threshold.weight) {
                return Err(format!(
                    "weight {} for {} outside [0, 1]",
                    threshold.weight, threshold.metric
                ));
            }
            weight_sum += threshold.weight;
        }
        if !require_all && weight_sum > 1.0 + f64::EPSILON {
            return Err(format!("threshold weights sum to {weight_sum:.2} (> 1.0)"));
        }
        Ok(())
    }

    fn invalid(&self, reason: String) -> PoolError {
        PoolError::PolicyInvalid {
            team_id: self.team_id.clone(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Maintain,
    EmergencyStop,
}

impl ScalingAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScaleUp => "scale_up",
            Self::ScaleDown => "scale_down",
            Self::Maintain => "maintain",
            Self::EmergencyStop => "emergency_stop",
        }
    }
}

impl std::str::FromStr for ScalingAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scale_up" => Ok(Self::ScaleUp),
            "scale_down" => Ok(Self::ScaleDown),
            "maintain" => Ok(Self::Maintain),
            "emergency_stop" => Ok(Self::EmergencyStop),
            other => Err(format!("unknown scaling action: {other}")),
        }
    }
}

/// What caused a decision to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTrigger {
    Metric(MetricName),
    Budget,
    Schedule,
    Prediction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    Success,
    Failure,
    Blocked,
}

impl ExecutionResult {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Blocked => "blocked",
        }
    }
}

impl std::str::FromStr for ExecutionResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "blocked" => Ok(Self::Blocked),
            other => Err(format!("unknown execution result: {other}")),
        }
    }
}

/// One evaluation outcome for a team. Appended to the bounded decision log;
/// persisted once executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub decision_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub team_id: String,
    pub action: ScalingAction,
    pub target_agent_count: u32,
    pub current_agent_count: u32,
    pub reason: String,
    pub triggers: Vec<DecisionTrigger>,
    pub confidence: f64,
    pub executed: bool,
    pub execution_result: Option<ExecutionResult>,
    pub block_reason: Option<String>,
}

impl ScalingDecision {
    #[must_use]
    pub fn maintain(team_id: &str, current: u32, reason: impl Into<String>) -> Self {
        Self {
            decision_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            team_id: team_id.to_string(),
            action: ScalingAction::Maintain,
            target_agent_count: current,
            current_agent_count: current,
            reason: reason.into(),
            triggers: Vec::new(),
            confidence: 1.0,
            executed: false,
            execution_result: None,
            block_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        let policy = ScalingPolicy::with_defaults("t1", 5, 50);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn min_above_max_rejected() {
        let mut policy = ScalingPolicy::with_defaults("t1", 5, 50);
        policy.min_agents = 60;
        let err = policy.validate().unwrap_err();
        assert!(matches!(err, PoolError::PolicyInvalid { .. }));
    }

    #[test]
    fn scale_down_floor_below_policy_min_rejected() {
        let mut policy = ScalingPolicy::with_defaults("t1", 5, 50);
        policy.scale_down.min_agents = 2;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn negative_threshold_rejected() {
        let mut policy = ScalingPolicy::with_defaults("t1", 5, 50);
        policy.scale_up.thresholds[0].value = -1.0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn overweight_thresholds_rejected_when_weighted() {
        let mut policy = ScalingPolicy::with_defaults("t1", 5, 50);
        policy.scale_up.thresholds[0].weight = 0.9;
        assert!(policy.validate().is_err());

        // Weights are ignored when all thresholds must hold.
        policy.scale_up.require_all = true;
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn step_size_deserializes_auto_and_fixed() {
        let auto: StepSize = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(auto, StepSize::AUTO);
        let fixed: StepSize = serde_json::from_str("3").unwrap();
        assert_eq!(fixed, StepSize::Fixed(3));
    }

    #[test]
    fn metric_names_round_trip() {
        let json = serde_json::to_string(&MetricName::QueueGrowthRate).unwrap();
        assert_eq!(json, "\"queue_growth_rate\"");
        let parsed: MetricName = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, MetricName::QueueGrowthRate);
    }
}
