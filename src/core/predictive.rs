//! Queue-growth history, depth prediction, and time-based schedules.

use crate::core::metrics::MetricsSample;
use crate::core::policy::{
    DecisionTrigger, ScalingAction, ScalingDecision, ScalingPolicy,
};
use crate::utils::config::PredictiveConfig;
use crate::utils::error::{PoolError, PoolResult};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

const MAX_SAMPLES: usize = 100;
const MAX_SAMPLE_AGE_MINUTES: i64 = 10;
/// Growth rate is taken over this many most-recent samples.
const RATE_SAMPLE_COUNT: usize = 10;
/// Below this elapsed span the rate is too noisy to use.
const MIN_RATE_SPAN_MINUTES: f64 = 0.5;
const PRE_WARM_MIN_CONFIDENCE: f64 = 0.5;
const PRE_WARM_DEPTH_TRIGGER: f64 = 20.0;
const PRE_WARM_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Copy)]
struct QueueObservation {
    at: DateTime<Utc>,
    depth: f64,
}

/// Projection of queue depth at a future horizon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePrediction {
    pub predicted_depth: f64,
    pub growth_rate_per_minute: f64,
    pub confidence: f64,
}

/// Bounded time-ordered window of queue-depth observations for one team.
#[derive(Debug, Default)]
pub struct QueueGrowthTracker {
    samples: VecDeque<QueueObservation>,
}

impl QueueGrowthTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, depth: f64) {
        self.record_at(Utc::now(), depth);
    }

    /// Insert an observation at an explicit timestamp, then prune by both
    /// the count and age bounds.
    pub fn record_at(&mut self, at: DateTime<Utc>, depth: f64) {
        self.samples.push_back(QueueObservation { at, depth });
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
        let cutoff = at - Duration::minutes(MAX_SAMPLE_AGE_MINUTES);
        while self.samples.front().is_some_and(|s| s.at < cutoff) {
            self.samples.pop_front();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Depth change in tasks per minute over the most recent samples.
    /// Zero when the covered span is too short to be meaningful.
    #[must_use]
    pub fn growth_rate_per_minute(&self) -> f64 {
        let recent: Vec<_> = self
            .samples
            .iter()
            .rev()
            .take(RATE_SAMPLE_COUNT)
            .collect();
        if recent.len() < 2 {
            return 0.0;
        }
        let newest = recent[0];
        let oldest = recent[recent.len() - 1];
        let minutes = (newest.at - oldest.at).num_milliseconds() as f64 / 60_000.0;
        if minutes < MIN_RATE_SPAN_MINUTES {
            return 0.0;
        }
        (newest.depth - oldest.depth) / minutes
    }

    /// Project depth `horizon_seconds` ahead of the given current depth.
    #[must_use]
    pub fn predict(&self, current_depth: f64, horizon_seconds: u64) -> QueuePrediction {
        let rate = self.growth_rate_per_minute();
        let predicted = (current_depth + (rate / 60.0) * horizon_seconds as f64).max(0.0);
        QueuePrediction {
            predicted_depth: predicted,
            growth_rate_per_minute: rate,
            confidence: self.confidence(),
        }
    }

    /// Confidence from sample count, refined by slope stability once the
    /// window is well populated.
    fn confidence(&self) -> f64 {
        let n = self.samples.len();
        if n == 0 {
            return 0.0;
        }
        if n < 5 {
            return 0.3;
        }
        if n < 20 {
            return 0.6;
        }

        let slopes = self.interval_slopes();
        if slopes.is_empty() {
            return 0.6;
        }
        let mean = slopes.iter().sum::<f64>() / slopes.len() as f64;
        let variance =
            slopes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / slopes.len() as f64;
        let std_dev = variance.sqrt();
        (1.0 - std_dev / (mean + 1.0).abs()).max(0.4)
    }

    fn interval_slopes(&self) -> Vec<f64> {
        self.samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .filter_map(|(a, b)| {
                let minutes = (b.at - a.at).num_milliseconds() as f64 / 60_000.0;
                (minutes > 0.0).then(|| (b.depth - a.depth) / minutes)
            })
            .collect()
    }
}

/// Simplified cron expression: `@hourly`, `@daily`, `@weekly`, or five
/// space-separated fields `minute hour day-of-month month day-of-week`,
/// each `*`, a value, or a comma list.
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    expression: String,
    fields: [CronField; 5],
}

#[derive(Debug, Clone, Default)]
enum CronField {
    #[default]
    Any,
    Values(Vec<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Values(values) => values.contains(&value),
        }
    }
}

impl ScheduleSpec {
    pub fn parse(expression: &str) -> PoolResult<Self> {
        let normalized = match expression.trim() {
            "@hourly" => "0 * * * *",
            "@daily" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            other => other,
        };

        let parts: Vec<&str> = normalized.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(PoolError::ValidationError {
                field: "schedule".to_string(),
                reason: format!("expected 5 cron fields, got {}", parts.len()),
            });
        }

        const RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];
        let mut fields: [CronField; 5] = Default::default();
        for (i, (part, (lo, hi))) in parts.iter().zip(RANGES).enumerate() {
            fields[i] = Self::parse_field(part, lo, hi)?;
        }

        Ok(Self {
            expression: expression.trim().to_string(),
            fields,
        })
    }

    fn parse_field(part: &str, lo: u32, hi: u32) -> PoolResult<CronField> {
        if part == "*" {
            return Ok(CronField::Any);
        }
        let mut values = Vec::new();
        for piece in part.split(',') {
            let value: u32 = piece.parse().map_err(|_| PoolError::ValidationError {
                field: "schedule".to_string(),
                reason: format!("invalid cron field value: {piece}"),
            })?;
            if value < lo || value > hi {
                return Err(PoolError::ValidationError {
                    field: "schedule".to_string(),
                    reason: format!("cron value {value} outside [{lo}, {hi}]"),
                });
            }
            values.push(value);
        }
        Ok(CronField::Values(values))
    }

    /// Whether the spec is active for the minute containing `now` (UTC).
    #[must_use]
    pub fn matches(&self, now: DateTime<Utc>) -> bool {
        self.fields[0].matches(now.minute())
            && self.fields[1].matches(now.hour())
            && self.fields[2].matches(now.day())
            && self.fields[3].matches(now.month())
            && self.fields[4].matches(now.weekday().num_days_from_sunday())
    }

    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Fixed capacity pinned to a cron window
#[derive(Debug, Clone)]
pub struct ScalingSchedule {
    pub spec: ScheduleSpec,
    pub target_agents: u32,
}

/// Per-team growth history and schedules; produces decisions the auto-scaler
/// adopts when threshold evaluation had nothing to say.
pub struct PredictiveScaler {
    config: PredictiveConfig,
    trackers: Arc<RwLock<HashMap<String, QueueGrowthTracker>>>,
    schedules: Arc<RwLock<HashMap<String, Vec<ScalingSchedule>>>>,
}

impl PredictiveScaler {
    #[must_use]
    pub fn new(config: PredictiveConfig) -> Self {
        Self {
            config,
            trackers: Arc::new(RwLock::new(HashMap::new())),
            schedules: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn record_sample(&self, team_id: &str, queue_depth: f64) {
        let mut trackers = self.trackers.write().await;
        trackers
            .entry(team_id.to_string())
            .or_default()
            .record(queue_depth);
    }

    pub async fn add_schedule(&self, team_id: &str, schedule: ScalingSchedule) {
        let mut schedules = self.schedules.write().await;
        schedules
            .entry(team_id.to_string())
            .or_default()
            .push(schedule);
    }

    pub async fn clear_schedules(&self, team_id: &str) {
        self.schedules.write().await.remove(team_id);
    }

    pub async fn predict(&self, team_id: &str, current_depth: f64, horizon_seconds: u64) -> QueuePrediction {
        let trackers = self.trackers.read().await;
        match trackers.get(team_id) {
            Some(tracker) => tracker.predict(current_depth, horizon_seconds),
            None => QueuePrediction {
                predicted_depth: current_depth,
                growth_rate_per_minute: 0.0,
                confidence: 0.0,
            },
        }
    }

    /// Schedule match first (bypasses everything, confidence 1.0), then
    /// pre-warm, then the growth-rate recommendation. `None` when nothing
    /// beats maintain.
    pub async fn decide(
        &self,
        policy: &ScalingPolicy,
        metrics: &MetricsSample,
        now: DateTime<Utc>,
    ) -> Option<ScalingDecision> {
        let current = metrics.current_agent_count;

        if let Some(target) = self.active_schedule_target(&policy.team_id, now).await {
            let target = target.clamp(policy.min_agents, policy.max_agents);
            if target != current {
                debug!(team_id = %policy.team_id, target, "schedule window active");
                return Some(Self::decision(
                    policy,
                    metrics,
                    target,
                    "scheduled capacity window".to_string(),
                    DecisionTrigger::Schedule,
                    1.0,
                    now,
                ));
            }
            return None;
        }

        let horizon = self.config.lead_time_minutes * 60;
        let prediction = self
            .predict(&policy.team_id, metrics.queue_depth, horizon)
            .await;

        if self.config.pre_warm.enabled
            && prediction.confidence >= PRE_WARM_MIN_CONFIDENCE
            && prediction.predicted_depth > PRE_WARM_DEPTH_TRIGGER
        {
            let target = self
                .config
                .pre_warm
                .agent_count
                .clamp(policy.min_agents, policy.max_agents);
            if target > current {
                return Some(Self::decision(
                    policy,
                    metrics,
                    target,
                    format!(
                        "pre-warm: projected depth {:.0} within {}m",
                        prediction.predicted_depth, self.config.lead_time_minutes
                    ),
                    DecisionTrigger::Prediction,
                    PRE_WARM_CONFIDENCE,
                    now,
                ));
            }
        }

        let growth_per_sec = prediction.growth_rate_per_minute / 60.0;
        if growth_per_sec > 0.5 {
            let recommended = ((prediction.predicted_depth / 5.0).ceil() as u32)
                .clamp(policy.min_agents, policy.max_agents);
            if recommended > current {
                return Some(Self::decision(
                    policy,
                    metrics,
                    recommended,
                    format!(
                        "queue growing {:.2}/s, projected depth {:.0}",
                        growth_per_sec, prediction.predicted_depth
                    ),
                    DecisionTrigger::Prediction,
                    prediction.confidence,
                    now,
                ));
            }
        } else if growth_per_sec < -0.5 && metrics.queue_depth < 5.0 {
            let floor = policy.scale_down.min_agents.max(policy.min_agents);
            if current > floor {
                return Some(Self::decision(
                    policy,
                    metrics,
                    (current - 1).max(floor),
                    format!("queue draining {:.2}/s", growth_per_sec),
                    DecisionTrigger::Prediction,
                    prediction.confidence,
                    now,
                ));
            }
        }

        None
    }

    async fn active_schedule_target(&self, team_id: &str, now: DateTime<Utc>) -> Option<u32> {
        let schedules = self.schedules.read().await;
        schedules
            .get(team_id)?
            .iter()
            .find(|s| s.spec.matches(now))
            .map(|s| s.target_agents)
    }

    fn decision(
        policy: &ScalingPolicy,
        metrics: &MetricsSample,
        target: u32,
        reason: String,
        trigger: DecisionTrigger,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> ScalingDecision {
        let current = metrics.current_agent_count;
        let action = if target > current {
            ScalingAction::ScaleUp
        } else {
            ScalingAction::ScaleDown
        };
        ScalingDecision {
            decision_id: Uuid::new_v4(),
            timestamp: now,
            team_id: policy.team_id.clone(),
            action,
            target_agent_count: target,
            current_agent_count: current,
            reason,
            triggers: vec![trigger],
            confidence,
            executed: false,
            execution_result: None,
            block_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap()
    }

    fn sample(agents: u32, queue_depth: f64) -> MetricsSample {
        MetricsSample {
            timestamp: Utc::now(),
            team_id: "t1".to_string(),
            current_agent_count: agents,
            queue_depth,
            queue_growth_rate: 0.0,
            cpu_percent: 50.0,
            memory_percent: 50.0,
            event_backlog: 0.0,
            completion_rate: 0.0,
            task_latency_ms: 0.0,
            agent_utilization: 0.0,
            current_cost: 0.0,
            budget_utilization: 0.0,
        }
    }

    #[test]
    fn empty_history_predicts_current_with_zero_confidence() {
        let tracker = QueueGrowthTracker::new();
        let prediction = tracker.predict(12.0, 300);
        assert_eq!(prediction.predicted_depth, 12.0);
        assert_eq!(prediction.confidence, 0.0);
    }

    #[test]
    fn growth_rate_from_recent_samples() {
        let mut tracker = QueueGrowthTracker::new();
        let t0 = base_time();
        // Depth climbs 10 tasks over 2 minutes: 5 tasks/minute.
        tracker.record_at(t0, 10.0);
        tracker.record_at(t0 + Duration::minutes(1), 15.0);
        tracker.record_at(t0 + Duration::minutes(2), 20.0);
        assert!((tracker.growth_rate_per_minute() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn short_span_yields_zero_rate() {
        let mut tracker = QueueGrowthTracker::new();
        let t0 = base_time();
        tracker.record_at(t0, 10.0);
        tracker.record_at(t0 + Duration::seconds(10), 50.0);
        assert_eq!(tracker.growth_rate_per_minute(), 0.0);
    }

    #[test]
    fn window_prunes_by_count_and_age() {
        let mut tracker = QueueGrowthTracker::new();
        let t0 = base_time();
        for i in 0..120 {
            tracker.record_at(t0 + Duration::seconds(i), 1.0);
        }
        assert!(tracker.len() <= MAX_SAMPLES);

        // A sample 15 minutes later expels everything older than 10 minutes.
        tracker.record_at(t0 + Duration::minutes(15), 1.0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn prediction_projects_growth() {
        let mut tracker = QueueGrowthTracker::new();
        let t0 = base_time();
        tracker.record_at(t0, 0.0);
        tracker.record_at(t0 + Duration::minutes(2), 12.0);
        // 6 tasks/minute; five minutes out from depth 12 → 42.
        let prediction = tracker.predict(12.0, 300);
        assert!((prediction.predicted_depth - 42.0).abs() < 1e-9);
    }

    #[test]
    fn prediction_never_negative() {
        let mut tracker = QueueGrowthTracker::new();
        let t0 = base_time();
        tracker.record_at(t0, 20.0);
        tracker.record_at(t0 + Duration::minutes(2), 2.0);
        let prediction = tracker.predict(2.0, 600);
        assert_eq!(prediction.predicted_depth, 0.0);
    }

    #[test]
    fn confidence_scales_with_samples() {
        let mut tracker = QueueGrowthTracker::new();
        let t0 = base_time();
        tracker.record_at(t0, 1.0);
        assert!((tracker.predict(1.0, 60).confidence - 0.3).abs() < 1e-9);

        for i in 1..10 {
            tracker.record_at(t0 + Duration::seconds(i * 5), 1.0);
        }
        assert!((tracker.predict(1.0, 60).confidence - 0.6).abs() < 1e-9);

        for i in 10..30 {
            tracker.record_at(t0 + Duration::seconds(i * 5), 1.0);
        }
        // Flat history: slopes are all zero, stability is perfect.
        assert!(tracker.predict(1.0, 60).confidence >= 0.4);
    }

    #[test]
    fn cron_shortcuts_and_fields() {
        let spec = ScheduleSpec::parse("@hourly").unwrap();
        assert!(spec.matches(base_time())); // minute 0
        assert!(!spec.matches(base_time() + Duration::minutes(30)));

        let spec = ScheduleSpec::parse("0 9 * * 1").unwrap();
        // 2026-03-02 is a Monday.
        assert!(spec.matches(base_time()));
        assert!(!spec.matches(base_time() + Duration::days(1)));
    }

    #[test]
    fn cron_rejects_bad_input() {
        assert!(ScheduleSpec::parse("not a cron").is_err());
        assert!(ScheduleSpec::parse("99 * * * *").is_err());
        assert!(ScheduleSpec::parse("* * * * * *").is_err());
    }

    #[tokio::test]
    async fn schedule_overrides_with_full_confidence() {
        let scaler = PredictiveScaler::new(PredictiveConfig::default());
        scaler
            .add_schedule(
                "t1",
                ScalingSchedule {
                    spec: ScheduleSpec::parse("0 9 * * *").unwrap(),
                    target_agents: 15,
                },
            )
            .await;

        let policy = ScalingPolicy::with_defaults("t1", 5, 50);
        let decision = scaler
            .decide(&policy, &sample(8, 0.0), base_time())
            .await
            .unwrap();
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_agent_count, 15);
        assert_eq!(decision.confidence, 1.0);
        assert_eq!(decision.triggers, vec![DecisionTrigger::Schedule]);

        // Outside the window nothing fires.
        let outside = scaler
            .decide(&policy, &sample(8, 0.0), base_time() + Duration::minutes(5))
            .await;
        assert!(outside.is_none());
    }

    #[tokio::test]
    async fn pre_warm_fires_on_projected_depth() {
        let config = PredictiveConfig {
            enabled: true,
            lead_time_minutes: 5,
            pre_warm: crate::utils::config::PreWarmConfig {
                enabled: true,
                agent_count: 12,
            },
        };
        let scaler = PredictiveScaler::new(config);

        // Steady climb: 6 tasks/minute over 8 samples → confidence 0.6.
        let t0 = base_time();
        for i in 0..8 {
            let mut trackers = scaler.trackers.write().await;
            trackers
                .entry("t1".to_string())
                .or_default()
                .record_at(t0 + Duration::minutes(i), (i as f64) * 6.0);
        }

        let policy = ScalingPolicy::with_defaults("t1", 5, 50);
        let mut metrics = sample(6, 42.0);
        metrics.queue_depth = 42.0;
        let decision = scaler.decide(&policy, &metrics, t0).await.unwrap();
        assert_eq!(decision.action, ScalingAction::ScaleUp);
        assert_eq!(decision.target_agent_count, 12);
        assert!((decision.confidence - 0.7).abs() < 1e-9);
        assert_eq!(decision.triggers, vec![DecisionTrigger::Prediction]);
    }
}
