//! Pure mapping from (policy, metrics, cooldown state, budget state) to a
//! scaling decision. No clocks, no I/O: callers pass `now`.

use crate::core::metrics::MetricsSample;
use crate::core::policy::{
    DecisionTrigger, MetricName, MetricThreshold, ScalingAction, ScalingDecision, ScalingPolicy,
    StepSize,
};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

pub struct PolicyEvaluator;

struct RuleOutcome {
    fired: bool,
    triggers: Vec<MetricName>,
    confidence: f64,
}

impl PolicyEvaluator {
    /// Evaluate one tick for one team.
    ///
    /// Precedence: budget force-down, then per-direction cooldowns, then
    /// scale-up thresholds, then scale-down thresholds, then maintain.
    #[must_use]
    pub fn evaluate(
        policy: &ScalingPolicy,
        metrics: &MetricsSample,
        last_scale_up_at: Option<DateTime<Utc>>,
        last_scale_down_at: Option<DateTime<Utc>>,
        budget_exceeded: bool,
        now: DateTime<Utc>,
    ) -> ScalingDecision {
        let current = metrics.current_agent_count;

        if budget_exceeded && current > policy.min_agents {
            let target = current.saturating_sub(1).max(policy.min_agents);
            return Self::decision(
                policy,
                metrics,
                ScalingAction::ScaleDown,
                target,
                "budget hard-stop breached, shedding one agent".to_string(),
                vec![DecisionTrigger::Budget],
                1.0,
                now,
            );
        }

        let up_cooldown = Self::cooldown_active(
            last_scale_up_at,
            policy.scale_up.cooldown_seconds,
            now,
        );
        let down_cooldown = Self::cooldown_active(
            last_scale_down_at,
            policy.scale_down.cooldown_seconds,
            now,
        );

        let up = Self::evaluate_rule(
            &policy.scale_up.thresholds,
            policy.scale_up.require_all,
            metrics,
        );
        if up.fired {
            if up_cooldown {
                return Self::decision(
                    policy,
                    metrics,
                    ScalingAction::Maintain,
                    current,
                    "scale-up cooldown active".to_string(),
                    up.triggers.into_iter().map(DecisionTrigger::Metric).collect(),
                    up.confidence,
                    now,
                );
            }
            if current < policy.max_agents {
                let step = Self::up_step(policy, metrics);
                let target = (current + step).min(policy.max_agents).max(policy.min_agents);
                return Self::decision(
                    policy,
                    metrics,
                    ScalingAction::ScaleUp,
                    target,
                    format!(
                        "scale-up thresholds fired (confidence {:.2})",
                        up.confidence
                    ),
                    up.triggers.into_iter().map(DecisionTrigger::Metric).collect(),
                    up.confidence,
                    now,
                );
            }
        }

        let down = Self::evaluate_rule(
            &policy.scale_down.thresholds,
            policy.scale_down.require_all,
            metrics,
        );
        if down.fired {
            let floor = policy.scale_down.min_agents.max(policy.min_agents);
            if down_cooldown {
                return Self::decision(
                    policy,
                    metrics,
                    ScalingAction::Maintain,
                    current,
                    "scale-down cooldown active".to_string(),
                    down.triggers.into_iter().map(DecisionTrigger::Metric).collect(),
                    down.confidence,
                    now,
                );
            }
            if current > floor {
                let step = Self::down_step(policy, metrics);
                let target = current.saturating_sub(step).max(floor);
                return Self::decision(
                    policy,
                    metrics,
                    ScalingAction::ScaleDown,
                    target,
                    format!(
                        "scale-down thresholds fired (confidence {:.2})",
                        down.confidence
                    ),
                    down.triggers.into_iter().map(DecisionTrigger::Metric).collect(),
                    down.confidence,
                    now,
                );
            }
        }

        Self::decision(
            policy,
            metrics,
            ScalingAction::Maintain,
            current,
            "no thresholds fired".to_string(),
            Vec::new(),
            1.0,
            now,
        )
    }

    fn cooldown_active(last: Option<DateTime<Utc>>, cooldown_seconds: u64, now: DateTime<Utc>) -> bool {
        last.is_some_and(|at| now - at < Duration::seconds(cooldown_seconds as i64))
    }

    /// All-must-hold rules fire on every threshold holding; weighted rules
    /// fire when the summed weight of holding thresholds reaches 0.5.
    fn evaluate_rule(
        thresholds: &[MetricThreshold],
        require_all: bool,
        metrics: &MetricsSample,
    ) -> RuleOutcome {
        if thresholds.is_empty() {
            return RuleOutcome {
                fired: false,
                triggers: Vec::new(),
                confidence: 0.0,
            };
        }

        let mut triggers = Vec::new();
        let mut score = 0.0;
        for threshold in thresholds {
            let observed = metrics.metric(threshold.metric);
            if threshold.op.compare(observed, threshold.value) {
                triggers.push(threshold.metric);
                score += threshold.weight;
            }
        }

        if require_all {
            let fired = triggers.len() == thresholds.len();
            RuleOutcome {
                fired,
                triggers,
                confidence: if fired { 1.0 } else { 0.0 },
            }
        } else {
            RuleOutcome {
                fired: score >= 0.5,
                triggers,
                confidence: score.min(1.0),
            }
        }
    }

    fn up_step(policy: &ScalingPolicy, metrics: &MetricsSample) -> u32 {
        match policy.scale_up.increment {
            StepSize::Fixed(n) => n,
            StepSize::Auto(_) => {
                let derived = (metrics.queue_depth / 10.0).ceil() as u32;
                derived.max(1).min(policy.scale_up.max_increment)
            }
        }
    }

    fn down_step(policy: &ScalingPolicy, metrics: &MetricsSample) -> u32 {
        match policy.scale_down.decrement {
            StepSize::Fixed(n) => n,
            StepSize::Auto(_) => {
                let threshold = policy
                    .scale_down
                    .thresholds
                    .iter()
                    .find(|t| t.metric == MetricName::QueueDepth)
                    .map_or(0.0, |t| t.value);
                let derived = ((threshold - metrics.queue_depth) / 5.0).floor().max(0.0) as u32;
                derived.max(1).min(policy.scale_down.max_decrement)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn decision(
        policy: &ScalingPolicy,
        metrics: &MetricsSample,
        action: ScalingAction,
        target: u32,
        reason: String,
        triggers: Vec<DecisionTrigger>,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> ScalingDecision {
        ScalingDecision {
            decision_id: Uuid::new_v4(),
            timestamp: now,
            team_id: policy.team_id.clone(),
            action,
            target_agent_count: target,
            current_agent_count: metrics.current_agent_count,
            reason,
            triggers,
            confidence,
            executed: false,
            execution_result: None,
            block_reason: None,
        }
    }
}
