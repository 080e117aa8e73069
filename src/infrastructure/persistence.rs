//! Durable store for checkpoints, failure records, recovery attempts,
//! escalations, and executed scaling decisions.
//!
//! SQLite-backed. The store is required at startup: an unopenable database is
//! a fatal typed error and the owning component refuses to initialize.

use crate::core::policy::{DecisionTrigger, ExecutionResult, ScalingAction, ScalingDecision};
use crate::healing::types::{
    DetectionSource, Escalation, FailedAgentRecord, RecoveryAttempt, RecoveryStrategy,
    SuggestedAction,
};
use crate::infrastructure::checkpoint::Checkpoint;
use crate::utils::error::{PoolError, PoolResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    data TEXT NOT NULL,
    metadata TEXT,
    compression_enabled INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_entity ON checkpoints(entity_id, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_checkpoints_type ON checkpoints(entity_type, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_checkpoints_timestamp ON checkpoints(timestamp);

CREATE TABLE IF NOT EXISTS failed_agents (
    agent_id TEXT NOT NULL UNIQUE,
    team_id TEXT,
    status TEXT NOT NULL,
    lifecycle_state TEXT NOT NULL,
    last_error TEXT,
    failed_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    detection_source TEXT NOT NULL,
    recovered INTEGER NOT NULL,
    escalated INTEGER NOT NULL,
    metadata TEXT
);

CREATE TABLE IF NOT EXISTS recovery_attempts (
    agent_id TEXT NOT NULL,
    team_id TEXT,
    attempt_number INTEGER NOT NULL,
    strategy TEXT NOT NULL,
    success INTEGER NOT NULL,
    error_message TEXT,
    duration_ms INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS idx_recovery_attempts_agent
    ON recovery_attempts(agent_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS escalation_events (
    agent_id TEXT NOT NULL,
    team_id TEXT,
    reason TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    suggested_action TEXT NOT NULL,
    handled INTEGER NOT NULL,
    handled_by TEXT,
    handled_at TEXT,
    timestamp TEXT NOT NULL,
    metadata TEXT
);
CREATE INDEX IF NOT EXISTS idx_escalation_events_agent
    ON escalation_events(agent_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS scaling_decisions (
    decision_id TEXT PRIMARY KEY,
    team_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    action TEXT NOT NULL,
    target_agent_count INTEGER NOT NULL,
    current_agent_count INTEGER NOT NULL,
    reason TEXT NOT NULL,
    triggers TEXT NOT NULL,
    confidence REAL NOT NULL,
    execution_result TEXT,
    block_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_scaling_decisions_team
    ON scaling_decisions(team_id, timestamp DESC);
";

/// Shared handle to the control-plane database.
#[derive(Clone)]
pub struct ControlStore {
    connection: Arc<Mutex<Connection>>,
}

impl ControlStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> PoolResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PoolError::DatabaseUnavailable {
                    path: path.display().to_string(),
                    reason: format!("failed to create parent directory: {e}"),
                })?;
        }

        let connection = Connection::open(path).map_err(|e| PoolError::DatabaseUnavailable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::init(connection, &path.display().to_string())
    }

    /// In-memory store, used by tests and ephemeral deployments.
    pub fn in_memory() -> PoolResult<Self> {
        let connection =
            Connection::open_in_memory().map_err(|e| PoolError::DatabaseUnavailable {
                path: ":memory:".to_string(),
                reason: e.to_string(),
            })?;
        Self::init(connection, ":memory:")
    }

    fn init(connection: Connection, path: &str) -> PoolResult<Self> {
        connection
            .execute_batch(SCHEMA)
            .map_err(|e| PoolError::DatabaseUnavailable {
                path: path.to_string(),
                reason: format!("schema initialization failed: {e}"),
            })?;
        info!(path, "control store opened");
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    // --- checkpoints ---

    pub async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> PoolResult<()> {
        let conn = self.connection.lock().await;
        let result = conn.execute(
            "INSERT INTO checkpoints
                (checkpoint_id, entity_type, entity_id, timestamp, data, metadata, compression_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                checkpoint.checkpoint_id,
                checkpoint.entity_type,
                checkpoint.entity_id,
                checkpoint.timestamp,
                checkpoint.data,
                checkpoint.metadata,
                checkpoint.compressed,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(PoolError::DuplicateCheckpoint {
                    checkpoint_id: checkpoint.checkpoint_id.clone(),
                })
            }
            Err(e) => Err(PoolError::persistence("insert_checkpoint", e)),
        }
    }

    pub async fn latest_checkpoint(&self, entity_id: &str) -> PoolResult<Option<Checkpoint>> {
        let checkpoints = self.checkpoints_for_entity(entity_id, Some(1), None).await?;
        Ok(checkpoints.into_iter().next())
    }

    pub async fn checkpoint_by_id(&self, checkpoint_id: &str) -> PoolResult<Option<Checkpoint>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT checkpoint_id, entity_type, entity_id, timestamp, data, metadata,
                        compression_enabled
                 FROM checkpoints WHERE checkpoint_id = ?1",
            )
            .map_err(|e| PoolError::persistence("checkpoint_by_id", e))?;
        let mut rows = stmt
            .query_map(params![checkpoint_id], Self::checkpoint_from_row)
            .map_err(|e| PoolError::persistence("checkpoint_by_id", e))?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.map_err(|e| PoolError::persistence("checkpoint_by_id", e))?,
            )),
            None => Ok(None),
        }
    }

    pub async fn checkpoints_for_entity(
        &self,
        entity_id: &str,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> PoolResult<Vec<Checkpoint>> {
        let conn = self.connection.lock().await;
        let limit = limit.map_or(i64::MAX, |l| l as i64);
        let since = since.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut stmt = conn
            .prepare(
                "SELECT checkpoint_id, entity_type, entity_id, timestamp, data, metadata,
                        compression_enabled
                 FROM checkpoints
                 WHERE entity_id = ?1 AND timestamp >= ?2
                 ORDER BY timestamp DESC, checkpoint_id DESC
                 LIMIT ?3",
            )
            .map_err(|e| PoolError::persistence("checkpoints_for_entity", e))?;
        let rows = stmt
            .query_map(params![entity_id, since, limit], Self::checkpoint_from_row)
            .map_err(|e| PoolError::persistence("checkpoints_for_entity", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| PoolError::persistence("checkpoints_for_entity", e))
    }

    pub async fn checkpoints_by_type(
        &self,
        entity_type: &str,
        limit: Option<usize>,
    ) -> PoolResult<Vec<Checkpoint>> {
        let conn = self.connection.lock().await;
        let limit = limit.map_or(i64::MAX, |l| l as i64);
        let mut stmt = conn
            .prepare(
                "SELECT checkpoint_id, entity_type, entity_id, timestamp, data, metadata,
                        compression_enabled
                 FROM checkpoints
                 WHERE entity_type = ?1
                 ORDER BY timestamp DESC, checkpoint_id DESC
                 LIMIT ?2",
            )
            .map_err(|e| PoolError::persistence("checkpoints_by_type", e))?;
        let rows = stmt
            .query_map(params![entity_type, limit], Self::checkpoint_from_row)
            .map_err(|e| PoolError::persistence("checkpoints_by_type", e))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| PoolError::persistence("checkpoints_by_type", e))
    }

    /// Keep the newest `keep` checkpoints for the entity; delete the rest.
    /// Ties on timestamp are broken by checkpoint_id.
    pub async fn prune_checkpoints(&self, entity_id: &str, keep: usize) -> PoolResult<usize> {
        let conn = self.connection.lock().await;
        let deleted = conn
            .execute(
                "DELETE FROM checkpoints
                 WHERE entity_id = ?1 AND checkpoint_id NOT IN (
                     SELECT checkpoint_id FROM checkpoints
                     WHERE entity_id = ?1
                     ORDER BY timestamp DESC, checkpoint_id DESC
                     LIMIT ?2
                 )",
                params![entity_id, keep as i64],
            )
            .map_err(|e| PoolError::persistence("prune_checkpoints", e))?;
        if deleted > 0 {
            debug!(entity_id, deleted, "pruned checkpoints beyond retention");
        }
        Ok(deleted)
    }

    pub async fn delete_entity_checkpoints(&self, entity_id: &str) -> PoolResult<usize> {
        let conn = self.connection.lock().await;
        conn.execute(
            "DELETE FROM checkpoints WHERE entity_id = ?1",
            params![entity_id],
        )
        .map_err(|e| PoolError::persistence("delete_entity_checkpoints", e))
    }

    pub async fn delete_checkpoints_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> PoolResult<usize> {
        let conn = self.connection.lock().await;
        conn.execute(
            "DELETE FROM checkpoints WHERE timestamp < ?1",
            params![cutoff],
        )
        .map_err(|e| PoolError::persistence("delete_checkpoints_older_than", e))
    }

    fn checkpoint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
        Ok(Checkpoint {
            checkpoint_id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            timestamp: row.get(3)?,
            data: row.get(4)?,
            metadata: row.get(5)?,
            compressed: row.get(6)?,
        })
    }

    // --- failed agents ---

    pub async fn upsert_failed_agent(&self, record: &FailedAgentRecord) -> PoolResult<()> {
        let lifecycle = if record.recovered || record.escalated {
            "closed"
        } else {
            "open"
        };
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO failed_agents
                (agent_id, team_id, status, lifecycle_state, last_error, failed_at,
                 retry_count, detection_source, recovered, escalated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(agent_id) DO UPDATE SET
                team_id = excluded.team_id,
                status = excluded.status,
                lifecycle_state = excluded.lifecycle_state,
                last_error = excluded.last_error,
                failed_at = excluded.failed_at,
                retry_count = excluded.retry_count,
                detection_source = excluded.detection_source,
                recovered = excluded.recovered,
                escalated = excluded.escalated",
            params![
                record.agent_id,
                record.team_id,
                record.status(),
                lifecycle,
                record.last_error,
                record.failed_at,
                record.retry_count,
                record.detection_source.as_str(),
                record.recovered,
                record.escalated,
            ],
        )
        .map_err(|e| PoolError::persistence("upsert_failed_agent", e))?;
        Ok(())
    }

    pub async fn get_failed_agent(&self, agent_id: &str) -> PoolResult<Option<FailedAgentRecord>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT agent_id, team_id, last_error, failed_at, retry_count,
                        detection_source, recovered, escalated
                 FROM failed_agents WHERE agent_id = ?1",
            )
            .map_err(|e| PoolError::persistence("get_failed_agent", e))?;
        let mut rows = stmt
            .query_map(params![agent_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, DateTime<Utc>>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, bool>(7)?,
                ))
            })
            .map_err(|e| PoolError::persistence("get_failed_agent", e))?;

        match rows.next() {
            Some(row) => {
                let (agent_id, team_id, last_error, failed_at, retry_count, source, recovered, escalated) =
                    row.map_err(|e| PoolError::persistence("get_failed_agent", e))?;
                let detection_source = source
                    .parse::<DetectionSource>()
                    .map_err(|e| PoolError::persistence("get_failed_agent", e))?;
                Ok(Some(FailedAgentRecord {
                    agent_id,
                    team_id,
                    detection_source,
                    failed_at,
                    retry_count,
                    last_error,
                    recovered,
                    escalated,
                }))
            }
            None => Ok(None),
        }
    }

    // --- recovery attempts ---

    pub async fn insert_recovery_attempt(&self, attempt: &RecoveryAttempt) -> PoolResult<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO recovery_attempts
                (agent_id, team_id, attempt_number, strategy, success, error_message,
                 duration_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                attempt.agent_id,
                attempt.team_id,
                attempt.attempt_number,
                attempt.strategy.as_str(),
                attempt.success,
                attempt.error,
                attempt.duration_ms,
                attempt.timestamp,
            ],
        )
        .map_err(|e| PoolError::persistence("insert_recovery_attempt", e))?;
        Ok(())
    }

    /// Most recent attempts first.
    pub async fn recent_attempts(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> PoolResult<Vec<RecoveryAttempt>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT agent_id, team_id, attempt_number, strategy, success, error_message,
                        duration_ms, timestamp
                 FROM recovery_attempts
                 WHERE agent_id = ?1
                 ORDER BY timestamp DESC, attempt_number DESC
                 LIMIT ?2",
            )
            .map_err(|e| PoolError::persistence("recent_attempts", e))?;
        let rows = stmt
            .query_map(params![agent_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, u64>(6)?,
                    row.get::<_, DateTime<Utc>>(7)?,
                ))
            })
            .map_err(|e| PoolError::persistence("recent_attempts", e))?;

        let mut attempts = Vec::new();
        for row in rows {
            let (agent_id, team_id, attempt_number, strategy, success, error, duration_ms, timestamp) =
                row.map_err(|e| PoolError::persistence("recent_attempts", e))?;
            attempts.push(RecoveryAttempt {
                agent_id,
                team_id,
                attempt_number,
                strategy: strategy
                    .parse::<RecoveryStrategy>()
                    .map_err(|e| PoolError::persistence("recent_attempts", e))?,
                success,
                duration_ms,
                error,
                timestamp,
            });
        }
        Ok(attempts)
    }

    // --- escalations ---

    pub async fn insert_escalation(&self, escalation: &Escalation) -> PoolResult<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO escalation_events
                (agent_id, team_id, reason, retry_count, suggested_action, handled,
                 handled_by, handled_at, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                escalation.agent_id,
                escalation.team_id,
                escalation.reason,
                escalation.retry_count,
                escalation.suggested_action.as_str(),
                escalation.handled,
                escalation.handled_by,
                escalation.handled_at,
                escalation.timestamp,
            ],
        )
        .map_err(|e| PoolError::persistence("insert_escalation", e))?;
        Ok(())
    }

    /// Close every unhandled escalation row for the agent. Returns whether
    /// anything was updated.
    pub async fn mark_escalation_handled(
        &self,
        agent_id: &str,
        handled_by: &str,
        handled_at: DateTime<Utc>,
    ) -> PoolResult<bool> {
        let conn = self.connection.lock().await;
        let updated = conn
            .execute(
                "UPDATE escalation_events
                 SET handled = 1, handled_by = ?2, handled_at = ?3
                 WHERE agent_id = ?1 AND handled = 0",
                params![agent_id, handled_by, handled_at],
            )
            .map_err(|e| PoolError::persistence("mark_escalation_handled", e))?;
        Ok(updated > 0)
    }

    pub async fn unhandled_escalation(&self, agent_id: &str) -> PoolResult<Option<Escalation>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT agent_id, team_id, reason, retry_count, suggested_action, handled,
                        handled_by, handled_at, timestamp
                 FROM escalation_events
                 WHERE agent_id = ?1 AND handled = 0
                 ORDER BY timestamp DESC
                 LIMIT 1",
            )
            .map_err(|e| PoolError::persistence("unhandled_escalation", e))?;
        let mut rows = stmt
            .query_map(params![agent_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<DateTime<Utc>>>(7)?,
                    row.get::<_, DateTime<Utc>>(8)?,
                ))
            })
            .map_err(|e| PoolError::persistence("unhandled_escalation", e))?;

        match rows.next() {
            Some(row) => {
                let (agent_id, team_id, reason, retry_count, action, handled, handled_by, handled_at, timestamp) =
                    row.map_err(|e| PoolError::persistence("unhandled_escalation", e))?;
                Ok(Some(Escalation {
                    agent_id,
                    team_id,
                    reason,
                    retry_count,
                    suggested_action: action
                        .parse::<SuggestedAction>()
                        .map_err(|e| PoolError::persistence("unhandled_escalation", e))?,
                    handled,
                    handled_by,
                    handled_at,
                    timestamp,
                }))
            }
            None => Ok(None),
        }
    }

    // --- scaling decisions ---

    pub async fn insert_decision(&self, decision: &ScalingDecision) -> PoolResult<()> {
        let triggers = serde_json::to_string(&decision.triggers)
            .map_err(PoolError::serialization)?;
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO scaling_decisions
                (decision_id, team_id, timestamp, action, target_agent_count,
                 current_agent_count, reason, triggers, confidence, execution_result,
                 block_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                decision.decision_id.to_string(),
                decision.team_id,
                decision.timestamp,
                decision.action.as_str(),
                decision.target_agent_count,
                decision.current_agent_count,
                decision.reason,
                triggers,
                decision.confidence,
                decision.execution_result.map(|r| r.as_str()),
                decision.block_reason,
            ],
        )
        .map_err(|e| PoolError::persistence("insert_decision", e))?;
        Ok(())
    }

    /// Most recent persisted decisions first.
    pub async fn decisions_for_team(
        &self,
        team_id: &str,
        limit: usize,
    ) -> PoolResult<Vec<ScalingDecision>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT decision_id, team_id, timestamp, action, target_agent_count,
                        current_agent_count, reason, triggers, confidence, execution_result,
                        block_reason
                 FROM scaling_decisions
                 WHERE team_id = ?1
                 ORDER BY timestamp DESC
                 LIMIT ?2",
            )
            .map_err(|e| PoolError::persistence("decisions_for_team", e))?;
        let rows = stmt
            .query_map(params![team_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, DateTime<Utc>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, f64>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            })
            .map_err(|e| PoolError::persistence("decisions_for_team", e))?;

        let mut decisions = Vec::new();
        for row in rows {
            let (id, team_id, timestamp, action, target, current, reason, triggers, confidence, exec, block) =
                row.map_err(|e| PoolError::persistence("decisions_for_team", e))?;
            let triggers: Vec<DecisionTrigger> =
                serde_json::from_str(&triggers).map_err(PoolError::serialization)?;
            decisions.push(ScalingDecision {
                decision_id: Uuid::parse_str(&id)
                    .map_err(|e| PoolError::persistence("decisions_for_team", e))?,
                team_id,
                timestamp,
                action: action
                    .parse::<ScalingAction>()
                    .map_err(|e| PoolError::persistence("decisions_for_team", e))?,
                target_agent_count: target,
                current_agent_count: current,
                reason,
                triggers,
                confidence,
                executed: exec.is_some(),
                execution_result: match exec {
                    Some(s) => Some(
                        s.parse::<ExecutionResult>()
                            .map_err(|e| PoolError::persistence("decisions_for_team", e))?,
                    ),
                    None => None,
                },
                block_reason: block,
            });
        }
        Ok(decisions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::ScalingAction;
    use crate::healing::types::DetectionSource;
    use serde_json::json;

    fn checkpoint(id: &str, entity_id: &str, offset_secs: i64) -> Checkpoint {
        Checkpoint {
            checkpoint_id: id.to_string(),
            entity_type: "agent".to_string(),
            entity_id: entity_id.to_string(),
            timestamp: Utc::now() + chrono::Duration::seconds(offset_secs),
            data: json!({"sequence": id}),
            metadata: None,
            compressed: false,
        }
    }

    #[tokio::test]
    async fn open_creates_database_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("control.db");
        let store = ControlStore::open(&path).await.unwrap();
        store.insert_checkpoint(&checkpoint("c1", "a1", 0)).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_and_latest() {
        let store = ControlStore::in_memory().unwrap();
        store.insert_checkpoint(&checkpoint("c1", "a1", 0)).await.unwrap();
        store.insert_checkpoint(&checkpoint("c2", "a1", 10)).await.unwrap();

        let latest = store.latest_checkpoint("a1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, "c2");
        assert_eq!(latest.data, json!({"sequence": "c2"}));
    }

    #[tokio::test]
    async fn duplicate_checkpoint_id_is_typed() {
        let store = ControlStore::in_memory().unwrap();
        store.insert_checkpoint(&checkpoint("c1", "a1", 0)).await.unwrap();
        let err = store
            .insert_checkpoint(&checkpoint("c1", "a1", 5))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::DuplicateCheckpoint { .. }));
    }

    #[tokio::test]
    async fn prune_keeps_newest() {
        let store = ControlStore::in_memory().unwrap();
        for i in 0..5 {
            store
                .insert_checkpoint(&checkpoint(&format!("c{i}"), "a1", i))
                .await
                .unwrap();
        }
        let deleted = store.prune_checkpoints("a1", 2).await.unwrap();
        assert_eq!(deleted, 3);

        let remaining = store.checkpoints_for_entity("a1", None, None).await.unwrap();
        let ids: Vec<_> = remaining.iter().map(|c| c.checkpoint_id.as_str()).collect();
        assert_eq!(ids, vec!["c4", "c3"]);
    }

    #[tokio::test]
    async fn age_cleanup_deletes_old_rows() {
        let store = ControlStore::in_memory().unwrap();
        store.insert_checkpoint(&checkpoint("old", "a1", -7200)).await.unwrap();
        store.insert_checkpoint(&checkpoint("new", "a1", 0)).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let deleted = store.delete_checkpoints_older_than(cutoff).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(
            store.latest_checkpoint("a1").await.unwrap().unwrap().checkpoint_id,
            "new"
        );
    }

    #[tokio::test]
    async fn failed_agent_upsert_is_idempotent_per_agent() {
        let store = ControlStore::in_memory().unwrap();
        let mut record = FailedAgentRecord::open("a1", Some("t1".to_string()), DetectionSource::HealthCheck);
        store.upsert_failed_agent(&record).await.unwrap();

        record.retry_count = 2;
        record.last_error = Some("timeout".to_string());
        store.upsert_failed_agent(&record).await.unwrap();

        let loaded = store.get_failed_agent("a1").await.unwrap().unwrap();
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(loaded.last_error.as_deref(), Some("timeout"));
        assert_eq!(loaded.team_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn recovery_attempts_ordered_newest_first() {
        let store = ControlStore::in_memory().unwrap();
        for attempt_number in 1..=3 {
            store
                .insert_recovery_attempt(&RecoveryAttempt {
                    agent_id: "a1".to_string(),
                    team_id: None,
                    attempt_number,
                    timestamp: Utc::now() + chrono::Duration::seconds(i64::from(attempt_number)),
                    strategy: RecoveryStrategy::Restart,
                    success: false,
                    duration_ms: 10,
                    error: Some("restart returned false".to_string()),
                })
                .await
                .unwrap();
        }
        let attempts = store.recent_attempts("a1", 2).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].attempt_number, 3);
        assert_eq!(attempts[1].attempt_number, 2);
    }

    #[tokio::test]
    async fn escalation_handled_flow() {
        let store = ControlStore::in_memory().unwrap();
        store
            .insert_escalation(&Escalation {
                agent_id: "a1".to_string(),
                team_id: None,
                reason: "max_retries_exceeded".to_string(),
                retry_count: 3,
                suggested_action: SuggestedAction::ManualReview,
                handled: false,
                handled_by: None,
                handled_at: None,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        assert!(store.unhandled_escalation("a1").await.unwrap().is_some());
        let updated = store
            .mark_escalation_handled("a1", "operator", Utc::now())
            .await
            .unwrap();
        assert!(updated);
        assert!(store.unhandled_escalation("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn decision_roundtrip() {
        let store = ControlStore::in_memory().unwrap();
        let mut decision = ScalingDecision::maintain("t1", 10, "test");
        decision.action = ScalingAction::ScaleUp;
        decision.target_agent_count = 12;
        decision.executed = true;
        decision.execution_result = Some(ExecutionResult::Success);
        decision.triggers = vec![DecisionTrigger::Metric(
            crate::core::policy::MetricName::QueueDepth,
        )];
        store.insert_decision(&decision).await.unwrap();

        let loaded = store.decisions_for_team("t1", 10).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].action, ScalingAction::ScaleUp);
        assert_eq!(loaded[0].target_agent_count, 12);
        assert_eq!(loaded[0].execution_result, Some(ExecutionResult::Success));
        assert_eq!(loaded[0].triggers.len(), 1);
    }
}
