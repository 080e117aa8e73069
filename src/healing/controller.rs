//! Liveness supervision and recovery for registered agents.
//!
//! The controller polls each agent's health on an interval. A failed check
//! opens an idempotent failure record and starts a per-agent recovery driver:
//! attempts run strictly sequentially under the agent's recovery circuit,
//! preferring checkpoint restore over plain restart, until the agent comes
//! back or retries are exhausted and the failure escalates.

use crate::healing::types::{
    AgentRecoveryHandler, DetectionSource, Escalation, FailedAgentRecord, HealingEvent,
    RecoveryAttempt, RecoveryStrategy, SuggestedAction,
};
use crate::infrastructure::checkpoint::{CheckpointManager, CheckpointProvider};
use crate::infrastructure::circuit_breaker::CircuitRegistry;
use crate::infrastructure::persistence::ControlStore;
use crate::utils::config::SelfHealingConfig;
use crate::utils::error::{PoolError, PoolResult};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Escalations look at this many trailing attempts to pick a suggestion.
const ESCALATION_LOOKBACK: usize = 3;

/// Bridges a recovery handler into the checkpoint manager's provider
/// registry, so supervised agents are checkpointed automatically.
struct HandlerCheckpointProvider {
    handler: Arc<dyn AgentRecoveryHandler>,
}

#[async_trait]
impl CheckpointProvider for HandlerCheckpointProvider {
    fn entity_id(&self) -> String {
        self.handler.agent_id()
    }

    fn entity_type(&self) -> String {
        "agent".to_string()
    }

    async fn checkpoint_data(&self) -> PoolResult<serde_json::Value> {
        self.handler.agent_state().await
    }

    async fn restore(&self, data: serde_json::Value) -> PoolResult<bool> {
        self.handler.restore_from_checkpoint(data).await
    }
}

/// Self-healing controller: health loop, recovery drivers, escalation.
#[derive(Clone)]
pub struct SelfHealingController {
    config: SelfHealingConfig,
    handlers: Arc<RwLock<HashMap<String, Arc<dyn AgentRecoveryHandler>>>>,
    failed: Arc<Mutex<HashMap<String, FailedAgentRecord>>>,
    escalated: Arc<Mutex<HashSet<String>>>,
    recovering: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    circuits: Arc<CircuitRegistry>,
    checkpoints: Option<CheckpointManager>,
    store: ControlStore,
    events: broadcast::Sender<HealingEvent>,
    shutdown: CancellationToken,
    loop_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SelfHealingController {
    pub fn new(
        config: SelfHealingConfig,
        store: ControlStore,
        circuits: Arc<CircuitRegistry>,
        checkpoints: Option<CheckpointManager>,
    ) -> PoolResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            failed: Arc::new(Mutex::new(HashMap::new())),
            escalated: Arc::new(Mutex::new(HashSet::new())),
            recovering: Arc::new(Mutex::new(HashMap::new())),
            circuits,
            checkpoints,
            store,
            events,
            shutdown: CancellationToken::new(),
            loop_handle: Arc::new(Mutex::new(None)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealingEvent> {
        self.events.subscribe()
    }

    /// Register an agent for supervision. With checkpointing active the
    /// handler doubles as the agent's checkpoint provider.
    pub async fn register_agent(&self, handler: Arc<dyn AgentRecoveryHandler>) -> PoolResult<()> {
        let agent_id = handler.agent_id();
        self.handlers
            .write()
            .await
            .insert(agent_id.clone(), Arc::clone(&handler));

        if let Some(cm) = self.active_checkpoints() {
            cm.register_provider(Arc::new(HandlerCheckpointProvider { handler }))
                .await?;
        }
        info!(agent_id, "agent registered for self-healing");
        Ok(())
    }

    /// Forget the agent entirely: handler, checkpoint schedule, failure and
    /// escalation membership, and any in-flight recovery.
    pub async fn unregister_agent(&self, agent_id: &str) -> PoolResult<()> {
        self.handlers.write().await.remove(agent_id);
        if let Some(cm) = self.active_checkpoints() {
            cm.unregister_provider(agent_id).await?;
        }
        if let Some(handle) = self.recovering.lock().await.remove(agent_id) {
            handle.abort();
        }
        self.failed.lock().await.remove(agent_id);
        self.escalated.lock().await.remove(agent_id);
        info!(agent_id, "agent unregistered");
        Ok(())
    }

    /// Start the health-check loop.
    pub async fn start(&self) {
        if !self.config.enabled {
            warn!("self-healing disabled by configuration");
            return;
        }
        let controller = self.clone();
        let cancel = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(controller.config.check_interval_ms));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => controller.check_health_once().await,
                }
            }
        });
        *self.loop_handle.lock().await = Some(handle);
        info!(
            interval_ms = self.config.check_interval_ms,
            "self-healing controller started"
        );
    }

    /// Cancel the loop and wait for in-flight checks and recoveries.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        let drivers: Vec<JoinHandle<()>> = {
            let mut recovering = self.recovering.lock().await;
            recovering.drain().map(|(_, handle)| handle).collect()
        };
        for handle in drivers {
            let _ = handle.await;
        }
        info!("self-healing controller stopped");
    }

    /// One health pass over every supervised agent. Checks run concurrently;
    /// agents already failed or escalated are skipped.
    pub async fn check_health_once(&self) {
        let handlers: Vec<(String, Arc<dyn AgentRecoveryHandler>)> = {
            let handlers = self.handlers.read().await;
            let failed = self.failed.lock().await;
            let escalated = self.escalated.lock().await;
            handlers
                .iter()
                .filter(|(id, _)| !failed.contains_key(*id) && !escalated.contains(*id))
                .map(|(id, handler)| (id.clone(), Arc::clone(handler)))
                .collect()
        };

        let deadline = Duration::from_millis(self.config.check_interval_ms);
        let checks = handlers.iter().map(|(agent_id, handler)| {
            let agent_id = agent_id.clone();
            let handler = Arc::clone(handler);
            async move {
                let verdict = tokio::time::timeout(deadline, handler.is_healthy()).await;
                match verdict {
                    Ok(Ok(true)) => (agent_id, None),
                    Ok(Ok(false)) => (agent_id, Some("health check returned false".to_string())),
                    Ok(Err(e)) => (agent_id, Some(e.to_string())),
                    Err(_) => (agent_id, Some("health check timed out".to_string())),
                }
            }
        });

        for (agent_id, unhealthy) in join_all(checks).await {
            if let Some(error) = unhealthy {
                debug!(agent_id, error, "agent unhealthy");
                self.handle_failure(&agent_id, DetectionSource::HealthCheck, Some(error))
                    .await;
            }
        }
    }

    /// External failure report (event bus, heartbeat gap, operator).
    pub async fn report_failure(
        &self,
        agent_id: &str,
        source: DetectionSource,
    ) -> PoolResult<()> {
        if !self.handlers.read().await.contains_key(agent_id) {
            return Err(PoolError::AgentNotFound {
                agent_id: agent_id.to_string(),
            });
        }
        self.handle_failure(agent_id, source, None).await;
        Ok(())
    }

    /// Open a failure record and start the recovery driver. Idempotent per
    /// agent: an active record swallows repeat reports.
    async fn handle_failure(
        &self,
        agent_id: &str,
        source: DetectionSource,
        error: Option<String>,
    ) {
        let team_id = {
            let handlers = self.handlers.read().await;
            match handlers.get(agent_id) {
                Some(handler) => handler.team_id(),
                None => return,
            }
        };

        {
            let escalated = self.escalated.lock().await;
            if escalated.contains(agent_id) {
                return;
            }
        }

        let mut record = FailedAgentRecord::open(agent_id, team_id.clone(), source);
        record.last_error = error;
        {
            let mut failed = self.failed.lock().await;
            if failed.contains_key(agent_id) {
                return;
            }
            failed.insert(agent_id.to_string(), record.clone());
        }

        if let Err(e) = self.store.upsert_failed_agent(&record).await {
            warn!(agent_id, error = %e, "failed to persist failure record");
        }
        warn!(agent_id, source = source.as_str(), "agent failure detected");
        let _ = self.events.send(HealingEvent::AgentFailed {
            agent_id: agent_id.to_string(),
            team_id,
            source,
        });

        self.spawn_recovery_driver(agent_id.to_string()).await;
    }

    async fn spawn_recovery_driver(&self, agent_id: String) {
        let mut recovering = self.recovering.lock().await;
        if recovering.contains_key(&agent_id) {
            return;
        }
        let controller = self.clone();
        let driver_id = agent_id.clone();
        let handle = tokio::spawn(async move {
            controller.run_recovery(&driver_id).await;
            controller.recovering.lock().await.remove(&driver_id);
        });
        recovering.insert(agent_id, handle);
    }

    /// Per-agent recovery driver: attempts are strictly sequential with the
    /// configured delay between them, each gated by the agent's circuit.
    async fn run_recovery(&self, agent_id: &str) {
        loop {
            let Some(record) = self.failed.lock().await.get(agent_id).cloned() else {
                return;
            };
            if record.retry_count >= self.config.max_retries {
                self.escalate(agent_id, &record).await;
                return;
            }
            let Some(handler) = self.handlers.read().await.get(agent_id).cloned() else {
                return;
            };

            let attempt_number = record.retry_count + 1;
            let attempt = self.attempt_recovery(agent_id, &handler, attempt_number).await;
            let success = attempt.success;

            if let Err(e) = self.store.insert_recovery_attempt(&attempt).await {
                warn!(agent_id, error = %e, "failed to persist recovery attempt");
            }

            let updated = {
                let mut failed = self.failed.lock().await;
                if let Some(record) = failed.get_mut(agent_id) {
                    record.retry_count = attempt_number;
                    record.last_error = attempt.error.clone();
                    if success {
                        record.recovered = true;
                    }
                    let updated = record.clone();
                    if success {
                        failed.remove(agent_id);
                    }
                    Some(updated)
                } else {
                    None
                }
            };
            if let Some(record) = &updated {
                if let Err(e) = self.store.upsert_failed_agent(record).await {
                    warn!(agent_id, error = %e, "failed to persist failure record");
                }
            }

            if success {
                info!(
                    agent_id,
                    attempt = attempt_number,
                    strategy = attempt.strategy.as_str(),
                    "agent recovered"
                );
                let _ = self.events.send(HealingEvent::RecoverySucceeded {
                    agent_id: agent_id.to_string(),
                    strategy: attempt.strategy,
                    attempt_number,
                });
                return;
            }

            error!(
                agent_id,
                attempt = attempt_number,
                error = attempt.error.as_deref().unwrap_or("unknown"),
                "recovery attempt failed"
            );
            let _ = self.events.send(HealingEvent::RecoveryFailed {
                agent_id: agent_id.to_string(),
                attempt_number,
                error: attempt.error.clone().unwrap_or_default(),
            });

            if attempt_number >= self.config.max_retries {
                if let Some(record) = updated {
                    self.escalate(agent_id, &record).await;
                }
                return;
            }

            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)) => {}
            }
        }
    }

    /// One gated attempt. Checkpoint restore is preferred when available;
    /// a non-restored outcome falls back to a plain restart.
    async fn attempt_recovery(
        &self,
        agent_id: &str,
        handler: &Arc<dyn AgentRecoveryHandler>,
        attempt_number: u32,
    ) -> RecoveryAttempt {
        let circuit = self.circuits.get_or_create(
            &format!("recovery-{agent_id}"),
            self.config.circuit_breaker.clone(),
        );
        let deadline = Duration::from_millis(self.config.check_interval_ms);
        let checkpoints = self.active_checkpoints();
        let chosen = if checkpoints.is_some() {
            RecoveryStrategy::Checkpoint
        } else {
            RecoveryStrategy::Restart
        };

        let started = Instant::now();
        let op_handler = Arc::clone(handler);
        let op_agent = agent_id.to_string();
        // An attempt that does not bring the agent back is an error so the
        // circuit counts it toward its failure window.
        let result: PoolResult<()> = circuit
            .execute(move || async move {
                let came_back = match &checkpoints {
                    Some(cm) => {
                        let outcome = with_deadline(
                            deadline,
                            cm.restore_from_latest(&op_agent),
                            "checkpoint restore",
                        )
                        .await?;
                        if outcome.is_restored() {
                            true
                        } else {
                            debug!(
                                agent_id = op_agent,
                                "no usable checkpoint, falling back to restart"
                            );
                            with_deadline(deadline, op_handler.restart(), "restart").await?
                        }
                    }
                    None => with_deadline(deadline, op_handler.restart(), "restart").await?,
                };
                if came_back {
                    Ok(())
                } else {
                    Err(PoolError::OperationFailed {
                        reason: "agent did not come back".to_string(),
                    })
                }
            })
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let (success, error) = match result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };

        RecoveryAttempt {
            agent_id: agent_id.to_string(),
            team_id: handler.team_id(),
            attempt_number,
            timestamp: Utc::now(),
            strategy: chosen,
            success,
            duration_ms,
            error,
        }
    }

    /// Recovery budget exhausted: persist the escalation, park the agent,
    /// and page whoever listens.
    async fn escalate(&self, agent_id: &str, record: &FailedAgentRecord) {
        if !self.config.enable_escalation {
            warn!(agent_id, "retries exhausted, escalation disabled; agent parked");
            return;
        }

        let recent = self
            .store
            .recent_attempts(agent_id, ESCALATION_LOOKBACK)
            .await
            .unwrap_or_default();
        let suggested_action = if recent.len() >= ESCALATION_LOOKBACK
            && recent.iter().all(|a| !a.success)
        {
            SuggestedAction::ManualReview
        } else {
            SuggestedAction::Notify
        };

        let escalation = Escalation {
            agent_id: agent_id.to_string(),
            team_id: record.team_id.clone(),
            reason: "max_retries_exceeded".to_string(),
            retry_count: record.retry_count,
            suggested_action,
            handled: false,
            handled_by: None,
            handled_at: None,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.insert_escalation(&escalation).await {
            warn!(agent_id, error = %e, "failed to persist escalation");
        }

        self.escalated.lock().await.insert(agent_id.to_string());
        let snapshot = {
            let mut failed = self.failed.lock().await;
            failed.get_mut(agent_id).map(|record| {
                record.escalated = true;
                record.clone()
            })
        };
        if let Some(record) = snapshot {
            if let Err(e) = self.store.upsert_failed_agent(&record).await {
                warn!(agent_id, error = %e, "failed to persist escalated record");
            }
        }

        error!(
            agent_id,
            retry_count = record.retry_count,
            suggested = suggested_action.as_str(),
            "agent escalated"
        );
        let _ = self.events.send(HealingEvent::Escalated {
            agent_id: agent_id.to_string(),
            retry_count: record.retry_count,
            suggested_action,
            reason: escalation.reason.clone(),
        });
        let _ = self.events.send(HealingEvent::EscalationNotice {
            agent_id: agent_id.to_string(),
            retry_count: record.retry_count,
            suggested_action,
            reason: escalation.reason,
        });
    }

    /// Operator acknowledgement: the agent rejoins normal supervision.
    pub async fn mark_escalation_handled(
        &self,
        agent_id: &str,
        handled_by: &str,
        _action: Option<SuggestedAction>,
    ) -> PoolResult<()> {
        let updated = self
            .store
            .mark_escalation_handled(agent_id, handled_by, Utc::now())
            .await?;
        if !updated {
            return Err(PoolError::EscalationNotFound {
                agent_id: agent_id.to_string(),
            });
        }

        self.escalated.lock().await.remove(agent_id);
        self.failed.lock().await.remove(agent_id);
        info!(agent_id, handled_by, "escalation handled");
        let _ = self.events.send(HealingEvent::EscalationHandled {
            agent_id: agent_id.to_string(),
            handled_by: handled_by.to_string(),
        });
        Ok(())
    }

    pub async fn failed_agents(&self) -> Vec<FailedAgentRecord> {
        self.failed.lock().await.values().cloned().collect()
    }

    pub async fn escalated_agents(&self) -> Vec<String> {
        self.escalated.lock().await.iter().cloned().collect()
    }

    /// Wait until no recovery driver is running; test and shutdown helper.
    pub async fn quiesce(&self) {
        loop {
            if self.recovering.lock().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn active_checkpoints(&self) -> Option<CheckpointManager> {
        if !self.config.use_checkpoints {
            return None;
        }
        self.checkpoints
            .as_ref()
            .filter(|cm| cm.enabled())
            .cloned()
    }
}

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = PoolResult<T>>,
    operation: &str,
) -> PoolResult<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| PoolError::Timeout {
            operation: operation.to_string(),
            timeout_ms: deadline.as_millis() as u64,
        })?
}
