use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for the agent-pool control plane.
///
/// Loops (scaling evaluation, health checks, checkpoint ticks) recover from
/// these locally; caller-facing methods surface them as typed results.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum PoolError {
    /// Policy and configuration errors
    #[error("Invalid scaling policy for team {team_id}: {reason}")]
    PolicyInvalid { team_id: String, reason: String },

    #[error("No scaling policy registered for team {team_id}")]
    PolicyNotFound { team_id: String },

    #[error("Configuration error: {reason}")]
    ConfigurationError { reason: String },

    #[error("Configuration file not found: {path}")]
    ConfigurationFileNotFound { path: String },

    #[error("Invalid input: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    /// Circuit breaker errors
    #[error("Circuit breaker '{name}' rejected the call (state: {state})")]
    CircuitOpen { name: String, state: String },

    #[error("Fallback failed after primary failure: {original}; fallback: {fallback}")]
    FallbackFailed { original: String, fallback: String },

    /// Checkpoint and persistence errors
    #[error("Checkpoint not found: {checkpoint_id}")]
    CheckpointNotFound { checkpoint_id: String },

    #[error("Duplicate checkpoint id: {checkpoint_id}")]
    DuplicateCheckpoint { checkpoint_id: String },

    #[error("Persistence error during {operation}: {reason}")]
    PersistenceError { operation: String, reason: String },

    #[error("Durable store unavailable at {path}: {reason}")]
    DatabaseUnavailable { path: String, reason: String },

    #[error("Serialization error: {reason}")]
    SerializationError { reason: String },

    /// External collaborator errors
    #[error("Metrics source unavailable for team {team_id}: {reason}")]
    MetricsUnavailable { team_id: String, reason: String },

    #[error("Orchestrator scale call failed for team {team_id}: {reason}")]
    OrchestratorFailed { team_id: String, reason: String },

    /// Self-healing errors
    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("No unhandled escalation for agent {agent_id}")]
    EscalationNotFound { agent_id: String },

    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Operation failed: {reason}")]
    OperationFailed { reason: String },
}

/// Result type alias used across the control plane
pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    /// Map a persistence-layer failure into a typed error without losing the
    /// operation context.
    pub fn persistence(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::PersistenceError {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }

    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::SerializationError {
            reason: err.to_string(),
        }
    }

    /// Whether the error is expected to clear on retry by the owning loop.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::MetricsUnavailable { .. }
                | Self::OrchestratorFailed { .. }
                | Self::Timeout { .. }
                | Self::PersistenceError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = PoolError::CircuitOpen {
            name: "recovery-a1".to_string(),
            state: "open".to_string(),
        };
        assert!(err.to_string().contains("recovery-a1"));
        assert!(err.to_string().contains("open"));
    }

    #[test]
    fn transient_classification() {
        assert!(PoolError::Timeout {
            operation: "scale".to_string(),
            timeout_ms: 30_000
        }
        .is_transient());
        assert!(!PoolError::PolicyNotFound {
            team_id: "t1".to_string()
        }
        .is_transient());
    }
}
