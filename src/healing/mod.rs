/// Health loop, recovery drivers, escalation
pub mod controller;
/// Failure records and the recovery handler capability
pub mod types;

pub use controller::SelfHealingController;
pub use types::{
    AgentRecoveryHandler, DetectionSource, Escalation, FailedAgentRecord, HealingEvent,
    RecoveryAttempt, RecoveryStrategy, SuggestedAction,
};
