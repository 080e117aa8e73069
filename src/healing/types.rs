//! Records and capability traits for agent failure handling.

use crate::utils::error::PoolResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a failure came to the controller's attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    HealthCheck,
    Event,
    Heartbeat,
    Manual,
}

impl DetectionSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HealthCheck => "health_check",
            Self::Event => "event",
            Self::Heartbeat => "heartbeat",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for DetectionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "health_check" => Ok(Self::HealthCheck),
            "event" => Ok(Self::Event),
            "heartbeat" => Ok(Self::Heartbeat),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown detection source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Restart,
    Checkpoint,
    Migrate,
}

impl RecoveryStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Checkpoint => "checkpoint",
            Self::Migrate => "migrate",
        }
    }
}

impl std::str::FromStr for RecoveryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restart" => Ok(Self::Restart),
            "checkpoint" => Ok(Self::Checkpoint),
            "migrate" => Ok(Self::Migrate),
            other => Err(format!("unknown recovery strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    ManualReview,
    Notify,
    AutoScale,
    Terminate,
}

impl SuggestedAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualReview => "manual_review",
            Self::Notify => "notify",
            Self::AutoScale => "auto_scale",
            Self::Terminate => "terminate",
        }
    }
}

impl std::str::FromStr for SuggestedAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual_review" => Ok(Self::ManualReview),
            "notify" => Ok(Self::Notify),
            "auto_scale" => Ok(Self::AutoScale),
            "terminate" => Ok(Self::Terminate),
            other => Err(format!("unknown suggested action: {other}")),
        }
    }
}

/// Open failure record; at most one active per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedAgentRecord {
    pub agent_id: String,
    pub team_id: Option<String>,
    pub detection_source: DetectionSource,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub recovered: bool,
    pub escalated: bool,
}

impl FailedAgentRecord {
    #[must_use]
    pub fn open(agent_id: &str, team_id: Option<String>, source: DetectionSource) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            team_id,
            detection_source: source,
            failed_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            recovered: false,
            escalated: false,
        }
    }

    /// Derived status column for the durable store
    #[must_use]
    pub fn status(&self) -> &'static str {
        if self.recovered {
            "recovered"
        } else if self.escalated {
            "escalated"
        } else {
            "active"
        }
    }
}

/// One attempt in the append-only recovery log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub agent_id: String,
    pub team_id: Option<String>,
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Declaration that automatic recovery is exhausted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub agent_id: String,
    pub team_id: Option<String>,
    pub reason: String,
    pub retry_count: u32,
    pub suggested_action: SuggestedAction,
    pub handled: bool,
    pub handled_by: Option<String>,
    pub handled_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

/// Capability set an agent exposes to the self-healing controller.
///
/// Implementations are plain values; the controller never assumes anything
/// about the agent runtime behind them.
#[async_trait]
pub trait AgentRecoveryHandler: Send + Sync {
    fn agent_id(&self) -> String;

    fn team_id(&self) -> Option<String> {
        None
    }

    async fn is_healthy(&self) -> PoolResult<bool>;

    /// Opaque state snapshot used for checkpointing
    async fn agent_state(&self) -> PoolResult<serde_json::Value>;

    /// Plain restart; `Ok(false)` means the agent did not come back.
    async fn restart(&self) -> PoolResult<bool>;

    /// Restore from checkpoint data; the return value decides success.
    async fn restore_from_checkpoint(&self, data: serde_json::Value) -> PoolResult<bool>;

    async fn status(&self) -> PoolResult<serde_json::Value>;
}

/// Events emitted by the self-healing controller
#[derive(Debug, Clone)]
pub enum HealingEvent {
    AgentFailed {
        agent_id: String,
        team_id: Option<String>,
        source: DetectionSource,
    },
    RecoverySucceeded {
        agent_id: String,
        strategy: RecoveryStrategy,
        attempt_number: u32,
    },
    RecoveryFailed {
        agent_id: String,
        attempt_number: u32,
        error: String,
    },
    Escalated {
        agent_id: String,
        retry_count: u32,
        suggested_action: SuggestedAction,
        reason: String,
    },
    /// Mirror of `Escalated` on the notification channel for integrations
    /// that only care about pages, not lifecycle.
    EscalationNotice {
        agent_id: String,
        retry_count: u32,
        suggested_action: SuggestedAction,
        reason: String,
    },
    EscalationHandled {
        agent_id: String,
        handled_by: String,
    },
}
