//! Evaluation loop that sizes each team against its workload.
//!
//! Every tick the scaler samples metrics, updates the budget tracker, asks
//! the policy evaluator for a decision (optionally overridden by predictive
//! scaling when thresholds had nothing to say), gates the result on budget
//! and rate limits, and dispatches it through the orchestrator adapter.

use crate::core::budget::{CostTracker, ScalingCostCheck};
use crate::core::evaluator::PolicyEvaluator;
use crate::core::metrics::{MetricsSample, MetricsSource};
use crate::core::policy::{ExecutionResult, ScalingAction, ScalingDecision, ScalingPolicy};
use crate::core::predictive::PredictiveScaler;
use crate::infrastructure::cache::SnapshotCache;
use crate::infrastructure::persistence::ControlStore;
use crate::utils::config::AutoScalerConfig;
use crate::utils::error::{PoolError, PoolResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DECISION_LOG_CAPACITY: usize = 1000;
const HISTORY_WINDOW: usize = 100;
const SNAPSHOT_TTL: Duration = Duration::from_secs(300);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// External system that actually adds or removes agents. `scale` must be
/// idempotent with respect to re-issuing the same target.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn scale(&self, team_id: &str, target_count: u32) -> PoolResult<()>;
}

#[derive(Debug, Clone)]
pub enum ScalingEvent {
    Decision {
        decision: ScalingDecision,
    },
    Blocked {
        team_id: String,
        reason: String,
        projected_cost: Option<f64>,
    },
    Executed {
        decision: ScalingDecision,
    },
}

#[derive(Debug, Default)]
struct TeamState {
    last_scale_up_at: Option<DateTime<Utc>>,
    last_scale_down_at: Option<DateTime<Utc>>,
    history: VecDeque<MetricsSample>,
}

#[derive(Debug)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

/// Policy-driven auto-scaler for all registered teams.
#[derive(Clone)]
pub struct AutoScaler {
    config: AutoScalerConfig,
    policies: Arc<RwLock<HashMap<String, ScalingPolicy>>>,
    teams: Arc<RwLock<HashMap<String, TeamState>>>,
    decisions: Arc<RwLock<VecDeque<ScalingDecision>>>,
    budget: Arc<CostTracker>,
    predictive: Arc<PredictiveScaler>,
    metrics: Arc<dyn MetricsSource>,
    orchestrator: Arc<dyn Orchestrator>,
    snapshots: Arc<SnapshotCache>,
    store: Option<ControlStore>,
    rate: Arc<Mutex<RateWindow>>,
    events: broadcast::Sender<ScalingEvent>,
    shutdown: CancellationToken,
    loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AutoScaler {
    pub fn new(
        config: AutoScalerConfig,
        metrics: Arc<dyn MetricsSource>,
        orchestrator: Arc<dyn Orchestrator>,
        budget: Arc<CostTracker>,
        predictive: Arc<PredictiveScaler>,
        snapshots: Arc<SnapshotCache>,
        store: Option<ControlStore>,
    ) -> PoolResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            policies: Arc::new(RwLock::new(HashMap::new())),
            teams: Arc::new(RwLock::new(HashMap::new())),
            decisions: Arc::new(RwLock::new(VecDeque::new())),
            budget,
            predictive,
            metrics,
            orchestrator,
            snapshots,
            store,
            rate: Arc::new(Mutex::new(RateWindow {
                count: 0,
                window_start: Instant::now(),
            })),
            events,
            shutdown: CancellationToken::new(),
            loop_handle: Arc::new(Mutex::new(None)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScalingEvent> {
        self.events.subscribe()
    }

    /// Register (or replace) the team's policy.
    pub async fn register_policy(&self, policy: ScalingPolicy) -> PoolResult<()> {
        policy.validate()?;
        let team_id = policy.team_id.clone();
        self.policies.write().await.insert(team_id.clone(), policy);
        self.teams.write().await.entry(team_id.clone()).or_default();
        info!(team_id, "scaling policy registered");
        Ok(())
    }

    /// Register a team under the configured default policy bounds.
    pub async fn register_team(&self, team_id: &str) -> PoolResult<()> {
        let defaults = &self.config.default_policy;
        self.register_policy(ScalingPolicy::with_defaults(
            team_id,
            defaults.min_agents,
            defaults.max_agents,
        ))
        .await
    }

    pub async fn remove_policy(&self, team_id: &str) {
        self.policies.write().await.remove(team_id);
        self.teams.write().await.remove(team_id);
    }

    pub async fn policy(&self, team_id: &str) -> Option<ScalingPolicy> {
        self.policies.read().await.get(team_id).cloned()
    }

    /// Start the evaluation loop. Ticks never overlap: a tick that outruns
    /// the interval causes the next fire to be skipped, not queued.
    pub async fn start(&self) {
        let scaler = self.clone();
        let cancel = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                scaler.config.evaluation_interval_seconds,
            ));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => scaler.evaluate_once().await,
                }
            }
        });
        *self.loop_handle.lock().await = Some(handle);
        info!(
            interval_seconds = self.config.evaluation_interval_seconds,
            "auto-scaler started"
        );
    }

    /// Cancel the loop and wait for any in-flight tick to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("auto-scaler stopped");
    }

    /// One full evaluation pass; teams are evaluated concurrently.
    pub async fn evaluate_once(&self) {
        let team_ids: Vec<String> = self.policies.read().await.keys().cloned().collect();
        let evaluations = team_ids.iter().map(|team_id| self.evaluate_team(team_id));
        for (team_id, result) in team_ids.iter().zip(join_all(evaluations).await) {
            if let Err(e) = result {
                error!(team_id, error = %e, "evaluation failed, continuing");
            }
        }
    }

    async fn evaluate_team(&self, team_id: &str) -> PoolResult<()> {
        let Some(policy) = self.policies.read().await.get(team_id).cloned() else {
            return Ok(());
        };
        let deadline = Duration::from_secs(self.config.evaluation_interval_seconds);

        let sample = tokio::time::timeout(deadline, self.metrics.sample(team_id))
            .await
            .map_err(|_| PoolError::Timeout {
                operation: format!("metrics sample for {team_id}"),
                timeout_ms: deadline.as_millis() as u64,
            })??;

        self.predictive
            .record_sample(team_id, sample.queue_depth)
            .await;
        if let Err(e) = self.budget.update_cost(team_id, sample.current_cost).await {
            warn!(team_id, error = %e, "cost update failed");
        }

        let (last_up, last_down) = {
            let mut teams = self.teams.write().await;
            let state = teams.entry(team_id.to_string()).or_default();
            state.history.push_back(sample.clone());
            while state.history.len() > HISTORY_WINDOW {
                state.history.pop_front();
            }
            (state.last_scale_up_at, state.last_scale_down_at)
        };

        let budget_exceeded = self.budget.hard_stop_breached(team_id).await;
        let now = Utc::now();
        let mut decision = PolicyEvaluator::evaluate(
            &policy,
            &sample,
            last_up,
            last_down,
            budget_exceeded,
            now,
        );

        if decision.action == ScalingAction::Maintain
            && policy.predictive
            && self.config.predictive.enabled
        {
            if let Some(predicted) = self.predictive.decide(&policy, &sample, now).await {
                debug!(team_id, "adopting predictive decision");
                decision = predicted;
            }
        }

        if self.config.debug {
            debug!(
                team_id,
                action = decision.action.as_str(),
                target = decision.target_agent_count,
                current = decision.current_agent_count,
                confidence = decision.confidence,
                reason = %decision.reason,
                "evaluation decision"
            );
        }

        self.process_decision(decision).await;
        self.write_snapshot(&sample).await;
        Ok(())
    }

    async fn process_decision(&self, mut decision: ScalingDecision) {
        let team_id = decision.team_id.clone();
        let _ = self.events.send(ScalingEvent::Decision {
            decision: decision.clone(),
        });

        if decision.action == ScalingAction::Maintain {
            self.push_decision(decision).await;
            return;
        }

        // Budget gates scale-ups only: budget-forced scale-downs must keep
        // converging even while the hard stop is breached.
        if decision.action == ScalingAction::ScaleUp {
            let check = self
                .budget
                .should_block_scaling(&team_id, decision.target_agent_count, 1.0)
                .await;
            if let ScalingCostCheck::Blocked { reason } = check {
                decision.execution_result = Some(ExecutionResult::Blocked);
                decision.block_reason = Some(reason.clone());
                warn!(team_id, reason, "scaling blocked by budget");
                let _ = self.events.send(ScalingEvent::Blocked {
                    team_id,
                    reason,
                    projected_cost: None,
                });
                self.push_decision(decision).await;
                return;
            }
        }

        if !self.try_acquire_rate_slot().await {
            let reason = "Rate limited".to_string();
            decision.execution_result = Some(ExecutionResult::Blocked);
            decision.block_reason = Some(reason.clone());
            warn!(team_id, "scaling blocked by rate limit");
            let _ = self.events.send(ScalingEvent::Blocked {
                team_id,
                reason,
                projected_cost: None,
            });
            self.push_decision(decision).await;
            return;
        }

        self.execute_decision(&mut decision).await;
        let _ = self.events.send(ScalingEvent::Executed {
            decision: decision.clone(),
        });
        self.push_decision(decision).await;
    }

    async fn execute_decision(&self, decision: &mut ScalingDecision) {
        let deadline = Duration::from_secs(self.config.evaluation_interval_seconds);
        let team_id = decision.team_id.clone();
        decision.executed = true;

        let outcome = tokio::time::timeout(
            deadline,
            self.orchestrator.scale(&team_id, decision.target_agent_count),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                decision.execution_result = Some(ExecutionResult::Success);
                let now = Utc::now();
                let mut teams = self.teams.write().await;
                let state = teams.entry(team_id.clone()).or_default();
                match decision.action {
                    ScalingAction::ScaleUp => state.last_scale_up_at = Some(now),
                    ScalingAction::ScaleDown | ScalingAction::EmergencyStop => {
                        state.last_scale_down_at = Some(now);
                    }
                    ScalingAction::Maintain => {}
                }
                info!(
                    team_id,
                    action = decision.action.as_str(),
                    target = decision.target_agent_count,
                    "scale command executed"
                );
            }
            Ok(Err(e)) => {
                decision.execution_result = Some(ExecutionResult::Failure);
                decision.block_reason = Some(e.to_string());
                warn!(team_id, error = %e, "scale command failed");
            }
            Err(_) => {
                decision.execution_result = Some(ExecutionResult::Failure);
                decision.block_reason = Some("orchestrator call timed out".to_string());
                warn!(team_id, "scale command timed out");
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.insert_decision(decision).await {
                warn!(team_id, error = %e, "failed to persist decision");
            }
        }
    }

    /// Operator hard stop: collapse the team to its policy floor, bypassing
    /// budget and rate gates.
    pub async fn emergency_stop(&self, team_id: &str, reason: &str) -> PoolResult<ScalingDecision> {
        let policy = self
            .policies
            .read()
            .await
            .get(team_id)
            .cloned()
            .ok_or_else(|| PoolError::PolicyNotFound {
                team_id: team_id.to_string(),
            })?;
        let sample = self.metrics.sample(team_id).await?;

        let mut decision = ScalingDecision {
            decision_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            team_id: team_id.to_string(),
            action: ScalingAction::EmergencyStop,
            target_agent_count: policy.min_agents,
            current_agent_count: sample.current_agent_count,
            reason: format!("emergency stop: {reason}"),
            triggers: Vec::new(),
            confidence: 1.0,
            executed: false,
            execution_result: None,
            block_reason: None,
        };

        self.execute_decision(&mut decision).await;
        let _ = self.events.send(ScalingEvent::Executed {
            decision: decision.clone(),
        });
        self.push_decision(decision.clone()).await;
        Ok(decision)
    }

    /// Fixed-window execution limit; the counter resets after an hour of
    /// wall time.
    async fn try_acquire_rate_slot(&self) -> bool {
        let mut rate = self.rate.lock().await;
        if rate.window_start.elapsed() >= Duration::from_secs(3600) {
            rate.count = 0;
            rate.window_start = Instant::now();
        }
        if rate.count >= self.config.max_scaling_operations_per_hour {
            return false;
        }
        rate.count += 1;
        true
    }

    async fn push_decision(&self, decision: ScalingDecision) {
        let mut decisions = self.decisions.write().await;
        decisions.push_back(decision);
        while decisions.len() > DECISION_LOG_CAPACITY {
            decisions.pop_front();
        }
    }

    async fn write_snapshot(&self, sample: &MetricsSample) {
        match serde_json::to_string(sample) {
            Ok(serialized) => {
                self.snapshots
                    .insert_with_ttl(
                        format!("scaling:metrics:{}", sample.team_id),
                        serialized,
                        SNAPSHOT_TTL,
                    )
                    .await;
            }
            Err(e) => warn!(team_id = %sample.team_id, error = %e, "snapshot serialization failed"),
        }
    }

    /// Newest decisions first for the given team.
    pub async fn recent_decisions(&self, team_id: &str, limit: usize) -> Vec<ScalingDecision> {
        self.decisions
            .read()
            .await
            .iter()
            .rev()
            .filter(|d| d.team_id == team_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Retained metrics window for the team, oldest first.
    pub async fn history(&self, team_id: &str) -> Vec<MetricsSample> {
        self.teams
            .read()
            .await
            .get(team_id)
            .map(|state| state.history.iter().cloned().collect())
            .unwrap_or_default()
    }
}
