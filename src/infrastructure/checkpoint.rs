//! Periodic snapshot and restore for named entities.
//!
//! Entities participate through a [`CheckpointProvider`] capability: the
//! manager pulls opaque state on a schedule, retains a bounded history per
//! entity in the durable store, and replays the newest snapshot on demand.

use crate::infrastructure::persistence::ControlStore;
use crate::utils::config::CheckpointConfig;
use crate::utils::error::PoolResult;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Opaque snapshot of entity state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub compressed: bool,
}

/// Capability set an entity exposes for checkpointing. Implementations are
/// plain values; no hierarchy.
#[async_trait]
pub trait CheckpointProvider: Send + Sync {
    fn entity_id(&self) -> String;
    fn entity_type(&self) -> String;
    async fn checkpoint_data(&self) -> PoolResult<serde_json::Value>;
    /// Apply checkpoint data; the return value decides success.
    async fn restore(&self, data: serde_json::Value) -> PoolResult<bool>;
}

/// Graceful, typed outcome of a restore request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { checkpoint_id: String },
    NoCheckpoint,
    NoProvider,
    ProviderDeclined { checkpoint_id: String },
}

impl RestoreOutcome {
    #[must_use]
    pub fn is_restored(&self) -> bool {
        matches!(self, Self::Restored { .. })
    }
}

#[derive(Debug, Clone)]
pub enum CheckpointEvent {
    Created {
        checkpoint_id: String,
        entity_id: String,
    },
    Restored {
        checkpoint_id: String,
        entity_id: String,
    },
    CleanupCompleted {
        removed: usize,
    },
}

struct ProviderEntry {
    provider: Arc<dyn CheckpointProvider>,
    schedule: CancellationToken,
}

/// Snapshot/restore service over the durable store.
#[derive(Clone)]
pub struct CheckpointManager {
    config: CheckpointConfig,
    store: ControlStore,
    providers: Arc<RwLock<HashMap<String, ProviderEntry>>>,
    events: broadcast::Sender<CheckpointEvent>,
    shutdown: CancellationToken,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(config: CheckpointConfig, store: ControlStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let manager = Self {
            config,
            store,
            providers: Arc::new(RwLock::new(HashMap::new())),
            events,
            shutdown: CancellationToken::new(),
        };
        if manager.config.enabled && manager.config.max_age_hours.is_some() {
            manager.spawn_cleanup_loop();
        }
        manager
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CheckpointEvent> {
        self.events.subscribe()
    }

    /// Persist a snapshot and prune the entity's history to the configured
    /// retention count.
    pub async fn create_checkpoint(
        &self,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> PoolResult<Checkpoint> {
        let checkpoint = Checkpoint {
            checkpoint_id: Self::generate_id(entity_id),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            timestamp: Utc::now(),
            data,
            metadata,
            compressed: self.config.compression_enabled,
        };

        self.store.insert_checkpoint(&checkpoint).await?;
        self.store
            .prune_checkpoints(entity_id, self.config.max_checkpoints_per_entity)
            .await?;

        debug!(
            entity_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            "checkpoint created"
        );
        let _ = self.events.send(CheckpointEvent::Created {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            entity_id: entity_id.to_string(),
        });
        Ok(checkpoint)
    }

    pub async fn get_latest(&self, entity_id: &str) -> PoolResult<Option<Checkpoint>> {
        self.store.latest_checkpoint(entity_id).await
    }

    pub async fn get_for_entity(
        &self,
        entity_id: &str,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> PoolResult<Vec<Checkpoint>> {
        self.store.checkpoints_for_entity(entity_id, limit, since).await
    }

    pub async fn get_by_type(
        &self,
        entity_type: &str,
        limit: Option<usize>,
    ) -> PoolResult<Vec<Checkpoint>> {
        self.store.checkpoints_by_type(entity_type, limit).await
    }

    /// Replay the newest checkpoint through the entity's provider.
    pub async fn restore_from_latest(&self, entity_id: &str) -> PoolResult<RestoreOutcome> {
        let Some(provider) = self.provider_for(entity_id).await else {
            return Ok(RestoreOutcome::NoProvider);
        };
        let Some(checkpoint) = self.store.latest_checkpoint(entity_id).await? else {
            return Ok(RestoreOutcome::NoCheckpoint);
        };
        Ok(self.apply_restore(&provider, checkpoint).await)
    }

    /// Replay a specific checkpoint by id.
    pub async fn restore_from_id(&self, checkpoint_id: &str) -> PoolResult<RestoreOutcome> {
        let Some(checkpoint) = self.store.checkpoint_by_id(checkpoint_id).await? else {
            return Ok(RestoreOutcome::NoCheckpoint);
        };
        let Some(provider) = self.provider_for(&checkpoint.entity_id).await else {
            return Ok(RestoreOutcome::NoProvider);
        };
        Ok(self.apply_restore(&provider, checkpoint).await)
    }

    async fn apply_restore(
        &self,
        provider: &Arc<dyn CheckpointProvider>,
        checkpoint: Checkpoint,
    ) -> RestoreOutcome {
        let checkpoint_id = checkpoint.checkpoint_id.clone();
        let entity_id = checkpoint.entity_id.clone();
        match provider.restore(checkpoint.data).await {
            Ok(true) => {
                info!(entity_id, checkpoint_id = %checkpoint_id, "restored from checkpoint");
                let _ = self.events.send(CheckpointEvent::Restored {
                    checkpoint_id: checkpoint_id.clone(),
                    entity_id,
                });
                RestoreOutcome::Restored { checkpoint_id }
            }
            Ok(false) => RestoreOutcome::ProviderDeclined { checkpoint_id },
            Err(e) => {
                warn!(entity_id, error = %e, "provider failed to apply checkpoint");
                RestoreOutcome::ProviderDeclined { checkpoint_id }
            }
        }
    }

    pub async fn delete_entity(&self, entity_id: &str) -> PoolResult<usize> {
        self.store.delete_entity_checkpoints(entity_id).await
    }

    /// Delete checkpoints older than the given (or configured) age.
    pub async fn cleanup(&self, max_age_hours: Option<u64>) -> PoolResult<usize> {
        let Some(hours) = max_age_hours.or(self.config.max_age_hours) else {
            return Ok(0);
        };
        let cutoff = Utc::now() - ChronoDuration::hours(hours as i64);
        let removed = self.store.delete_checkpoints_older_than(cutoff).await?;
        if removed > 0 {
            info!(removed, hours, "aged-out checkpoints removed");
        }
        let _ = self.events.send(CheckpointEvent::CleanupCompleted { removed });
        Ok(removed)
    }

    /// Register a provider. With auto-checkpointing enabled this takes an
    /// immediate snapshot and schedules periodic ones; a prior registration
    /// for the same entity is replaced and its schedule cancelled.
    pub async fn register_provider(&self, provider: Arc<dyn CheckpointProvider>) -> PoolResult<()> {
        let entity_id = provider.entity_id();
        let schedule = self.shutdown.child_token();

        {
            let mut providers = self.providers.write().await;
            if let Some(previous) = providers.insert(
                entity_id.clone(),
                ProviderEntry {
                    provider: Arc::clone(&provider),
                    schedule: schedule.clone(),
                },
            ) {
                previous.schedule.cancel();
            }
        }

        if self.config.enabled {
            if let Err(e) = self.checkpoint_provider(&provider).await {
                warn!(entity_id, error = %e, "initial checkpoint failed");
            }
            self.spawn_provider_loop(provider, schedule);
        }
        Ok(())
    }

    /// Cancel the entity's schedule and forget the provider. Leaves stored
    /// checkpoints in place.
    pub async fn unregister_provider(&self, entity_id: &str) -> PoolResult<()> {
        let mut providers = self.providers.write().await;
        if let Some(entry) = providers.remove(entity_id) {
            entry.schedule.cancel();
            debug!(entity_id, "checkpoint provider unregistered");
        }
        Ok(())
    }

    pub async fn registered_entities(&self) -> Vec<String> {
        self.providers.read().await.keys().cloned().collect()
    }

    /// Cancel every schedule and the cleanup loop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn provider_for(&self, entity_id: &str) -> Option<Arc<dyn CheckpointProvider>> {
        self.providers
            .read()
            .await
            .get(entity_id)
            .map(|entry| Arc::clone(&entry.provider))
    }

    async fn checkpoint_provider(&self, provider: &Arc<dyn CheckpointProvider>) -> PoolResult<()> {
        let data = provider.checkpoint_data().await?;
        self.create_checkpoint(&provider.entity_type(), &provider.entity_id(), data, None)
            .await?;
        Ok(())
    }

    fn spawn_provider_loop(&self, provider: Arc<dyn CheckpointProvider>, cancel: CancellationToken) {
        let manager = self.clone();
        let interval = Duration::from_millis(self.config.interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        if let Err(e) = manager.checkpoint_provider(&provider).await {
                            warn!(
                                entity_id = %provider.entity_id(),
                                error = %e,
                                "periodic checkpoint failed"
                            );
                        }
                    }
                }
            }
        });
    }

    fn spawn_cleanup_loop(&self) {
        let manager = self.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(CLEANUP_INTERVAL) => {
                        if let Err(e) = manager.cleanup(None).await {
                            warn!(error = %e, "checkpoint age cleanup failed");
                        }
                    }
                }
            }
        });
    }

    /// `chk_<short(entity_id)>_<time36>_<rand36>`
    fn generate_id(entity_id: &str) -> String {
        let short: String = entity_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect();
        let time36 = to_base36(Utc::now().timestamp_millis().unsigned_abs() as u128);
        let rand36 = to_base36(u128::from(rand::thread_rng().gen::<u32>()));
        format!("chk_{short}_{time36}_{rand36}")
    }
}

fn to_base36(mut value: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
