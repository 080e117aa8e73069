//! Metrics samples and the pluggable source that produces them.

use crate::core::policy::MetricName;
use crate::infrastructure::cache::MetricsCache;
use crate::utils::error::PoolResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One observation of a team's workload, produced each evaluation tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    pub team_id: String,
    pub current_agent_count: u32,
    pub queue_depth: f64,
    /// Tasks per minute
    pub queue_growth_rate: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub event_backlog: f64,
    /// Tasks per minute
    pub completion_rate: f64,
    pub task_latency_ms: f64,
    pub agent_utilization: f64,
    pub current_cost: f64,
    pub budget_utilization: f64,
}

impl MetricsSample {
    /// Value of a named metric within this sample, for threshold evaluation.
    #[must_use]
    pub fn metric(&self, name: MetricName) -> f64 {
        match name {
            MetricName::QueueDepth => self.queue_depth,
            MetricName::QueueGrowthRate => self.queue_growth_rate,
            MetricName::AgentCpuPercent => self.cpu_percent,
            MetricName::AgentMemoryPercent => self.memory_percent,
            MetricName::EventBacklogSize => self.event_backlog,
            MetricName::AgentUtilization => self.agent_utilization,
            MetricName::TaskCompletionRate => self.completion_rate,
        }
    }
}

/// Source of metrics samples; the control plane never assumes where the
/// numbers come from.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self, team_id: &str) -> PoolResult<MetricsSample>;
}

/// Reference source reading individual gauges from the shared cache, with
/// fixed defaults on miss.
pub struct CacheMetricsSource {
    cache: Arc<MetricsCache>,
}

impl CacheMetricsSource {
    #[must_use]
    pub fn new(cache: Arc<MetricsCache>) -> Self {
        Self { cache }
    }

    async fn gauge(&self, team_id: &str, name: &str, default: f64) -> f64 {
        self.cache
            .get(&format!("metrics:{team_id}:{name}"))
            .await
            .unwrap_or(default)
    }
}

#[async_trait]
impl MetricsSource for CacheMetricsSource {
    async fn sample(&self, team_id: &str) -> PoolResult<MetricsSample> {
        let current_agent_count = self
            .cache
            .get(&format!("team:{team_id}:agent_count"))
            .await
            .unwrap_or(5.0) as u32;

        Ok(MetricsSample {
            timestamp: Utc::now(),
            team_id: team_id.to_string(),
            current_agent_count,
            queue_depth: self.gauge(team_id, "queue_depth", 0.0).await,
            queue_growth_rate: self.gauge(team_id, "queue_growth_rate", 0.0).await,
            cpu_percent: self.gauge(team_id, "agent_cpu_percent", 50.0).await,
            memory_percent: self.gauge(team_id, "agent_memory_percent", 50.0).await,
            event_backlog: self.gauge(team_id, "event_backlog_size", 0.0).await,
            completion_rate: self.gauge(team_id, "task_completion_rate", 0.0).await,
            task_latency_ms: self.gauge(team_id, "task_latency_ms", 0.0).await,
            agent_utilization: self.gauge(team_id, "agent_utilization", 0.0).await,
            current_cost: self.gauge(team_id, "current_cost", 0.0).await,
            budget_utilization: self.gauge(team_id, "budget_utilization", 0.0).await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn defaults_on_cache_miss() {
        let cache = Arc::new(MetricsCache::new(Duration::from_secs(60), 100));
        let source = CacheMetricsSource::new(cache);

        let sample = source.sample("t1").await.unwrap();
        assert_eq!(sample.current_agent_count, 5);
        assert_eq!(sample.queue_depth, 0.0);
        assert_eq!(sample.cpu_percent, 50.0);
        assert_eq!(sample.memory_percent, 50.0);
        assert_eq!(sample.budget_utilization, 0.0);
    }

    #[tokio::test]
    async fn published_gauges_are_read_back() {
        let cache = Arc::new(MetricsCache::new(Duration::from_secs(60), 100));
        cache.insert("metrics:t1:queue_depth".to_string(), 15.0).await;
        cache.insert("team:t1:agent_count".to_string(), 10.0).await;

        let source = CacheMetricsSource::new(cache);
        let sample = source.sample("t1").await.unwrap();
        assert_eq!(sample.queue_depth, 15.0);
        assert_eq!(sample.current_agent_count, 10);
    }

    #[test]
    fn metric_lookup_matches_fields() {
        let sample = MetricsSample {
            timestamp: Utc::now(),
            team_id: "t1".to_string(),
            current_agent_count: 4,
            queue_depth: 1.0,
            queue_growth_rate: 2.0,
            cpu_percent: 3.0,
            memory_percent: 4.0,
            event_backlog: 5.0,
            completion_rate: 6.0,
            task_latency_ms: 7.0,
            agent_utilization: 0.5,
            current_cost: 9.0,
            budget_utilization: 0.1,
        };
        assert_eq!(sample.metric(MetricName::QueueDepth), 1.0);
        assert_eq!(sample.metric(MetricName::AgentUtilization), 0.5);
        assert_eq!(sample.metric(MetricName::TaskCompletionRate), 6.0);
    }
}
