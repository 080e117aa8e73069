use crate::core::autoscaler::{AutoScaler, Orchestrator, ScalingEvent};
use crate::core::budget::CostTracker;
use crate::core::metrics::{CacheMetricsSource, MetricsSource};
use crate::core::policy::{ExecutionResult, ScalingAction, ScalingPolicy};
use crate::core::predictive::PredictiveScaler;
use crate::healing::controller::SelfHealingController;
use crate::healing::types::AgentRecoveryHandler;
use crate::infrastructure::cache::{MetricsCache, SnapshotCache};
use crate::infrastructure::checkpoint::CheckpointManager;
use crate::infrastructure::circuit_breaker::CircuitRegistry;
use crate::infrastructure::persistence::ControlStore;
use crate::utils::config::{
    AutoScalerConfig, CheckpointConfig, SelfHealingConfig,
};
use crate::utils::error::PoolResult;
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingOrchestrator {
    calls: Mutex<Vec<(String, u32)>>,
}

#[async_trait]
impl Orchestrator for RecordingOrchestrator {
    async fn scale(&self, team_id: &str, target_count: u32) -> PoolResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((team_id.to_string(), target_count));
        Ok(())
    }
}

struct FlakyAgent {
    id: String,
    healthy: AtomicBool,
    restores: AtomicUsize,
}

#[async_trait]
impl AgentRecoveryHandler for FlakyAgent {
    fn agent_id(&self) -> String {
        self.id.clone()
    }

    fn team_id(&self) -> Option<String> {
        Some("t1".to_string())
    }

    async fn is_healthy(&self) -> PoolResult<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    async fn agent_state(&self) -> PoolResult<serde_json::Value> {
        Ok(json!({"cursor": 7}))
    }

    async fn restart(&self) -> PoolResult<bool> {
        self.healthy.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn restore_from_checkpoint(&self, _data: serde_json::Value) -> PoolResult<bool> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        self.healthy.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn status(&self) -> PoolResult<serde_json::Value> {
        Ok(json!({}))
    }
}

fn autoscaler_over_cache(
    store: ControlStore,
    orchestrator: Arc<RecordingOrchestrator>,
) -> (AutoScaler, Arc<MetricsCache>, Arc<SnapshotCache>) {
    let config = AutoScalerConfig::default();
    let metrics_cache = Arc::new(MetricsCache::new(Duration::from_secs(300), 1_000));
    let snapshots = Arc::new(SnapshotCache::new(Duration::from_secs(300), 1_000));
    let scaler = AutoScaler::new(
        config.clone(),
        Arc::new(CacheMetricsSource::new(Arc::clone(&metrics_cache))) as Arc<dyn MetricsSource>,
        orchestrator as Arc<dyn Orchestrator>,
        Arc::new(CostTracker::new(config.cost_tracking.clone())),
        Arc::new(PredictiveScaler::new(config.predictive.clone())),
        Arc::clone(&snapshots),
        Some(store),
    )
    .unwrap();
    (scaler, metrics_cache, snapshots)
}

#[tokio::test]
async fn cache_metrics_drive_scaling_and_persist_decision() {
    let store = ControlStore::in_memory().unwrap();
    let orchestrator = Arc::new(RecordingOrchestrator::default());
    let (scaler, metrics_cache, snapshots) =
        autoscaler_over_cache(store.clone(), Arc::clone(&orchestrator));

    scaler
        .register_policy(ScalingPolicy::with_defaults("t1", 5, 50))
        .await
        .unwrap();
    metrics_cache
        .insert("metrics:t1:queue_depth".to_string(), 15.0)
        .await;
    metrics_cache
        .insert("team:t1:agent_count".to_string(), 10.0)
        .await;

    let mut events = scaler.subscribe();
    scaler.evaluate_once().await;

    // The scale command reached the orchestrator with the computed target.
    assert_eq!(
        orchestrator.calls.lock().unwrap().clone(),
        vec![("t1".to_string(), 12)]
    );

    // The executed decision landed in the durable store.
    let persisted = store.decisions_for_team("t1", 10).await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].action, ScalingAction::ScaleUp);
    assert_eq!(persisted[0].execution_result, Some(ExecutionResult::Success));

    // A serialized snapshot was written back for other consumers.
    assert!(snapshots
        .get(&"scaling:metrics:t1".to_string())
        .await
        .is_some());

    // Events arrive in emission order: decision, then executed.
    let mut order = Vec::new();
    while let Ok(event) = events.try_recv() {
        order.push(match event {
            ScalingEvent::Decision { .. } => "decision",
            ScalingEvent::Blocked { .. } => "blocked",
            ScalingEvent::Executed { .. } => "executed",
        });
    }
    assert_eq!(order, vec!["decision", "executed"]);
}

#[tokio::test]
async fn defaulted_metrics_maintain_quietly() {
    let store = ControlStore::in_memory().unwrap();
    let orchestrator = Arc::new(RecordingOrchestrator::default());
    let (scaler, _metrics_cache, _snapshots) =
        autoscaler_over_cache(store.clone(), Arc::clone(&orchestrator));

    // Nothing published: queue depth defaults to 0, agent count to 5.
    scaler
        .register_policy(ScalingPolicy::with_defaults("t1", 5, 50))
        .await
        .unwrap();
    scaler.evaluate_once().await;

    assert!(orchestrator.calls.lock().unwrap().is_empty());
    let decisions = scaler.recent_decisions("t1", 10).await;
    assert_eq!(decisions[0].action, ScalingAction::Maintain);
    // Nothing executed, nothing persisted.
    assert!(store.decisions_for_team("t1", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_agent_recovers_from_checkpoint_under_shared_registry() {
    let store = ControlStore::in_memory().unwrap();
    let registry = Arc::new(CircuitRegistry::new());
    let checkpoints = CheckpointManager::new(
        CheckpointConfig {
            enabled: true,
            interval_ms: 60_000,
            max_checkpoints_per_entity: 5,
            max_age_hours: None,
            compression_enabled: false,
        },
        store.clone(),
    );
    let controller = SelfHealingController::new(
        SelfHealingConfig {
            check_interval_ms: 500,
            retry_delay_ms: 10,
            ..SelfHealingConfig::default()
        },
        store.clone(),
        Arc::clone(&registry),
        Some(checkpoints.clone()),
    )
    .unwrap();

    let agent = Arc::new(FlakyAgent {
        id: "a1".to_string(),
        healthy: AtomicBool::new(true),
        restores: AtomicUsize::new(0),
    });
    controller
        .register_agent(Arc::clone(&agent) as Arc<dyn AgentRecoveryHandler>)
        .await
        .unwrap();

    // Registration checkpointed the agent immediately.
    let latest = checkpoints.get_latest("a1").await.unwrap().unwrap();
    assert_eq!(latest.data, json!({"cursor": 7}));

    agent.healthy.store(false, Ordering::SeqCst);
    controller.check_health_once().await;
    controller.quiesce().await;

    // Recovered through the checkpoint path, gated by the agent's circuit.
    assert_eq!(agent.restores.load(Ordering::SeqCst), 1);
    assert!(controller.failed_agents().await.is_empty());
    assert!(registry
        .names()
        .contains(&"recovery-a1".to_string()));

    let attempts = store.recent_attempts("a1", 10).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].success);
}
