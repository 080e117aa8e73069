//! Rolling-period cost accounting with alerting and a hard stop for
//! scale-ups that would breach the budget.

use crate::utils::config::CostTrackingConfig;
use crate::utils::error::{PoolError, PoolResult};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const ALERT_COOLDOWN: Duration = Duration::hours(1);
const EXHAUSTION_IMMINENT_HOURS: f64 = 24.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

/// Budget registered per team; resets at the aligned period boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamBudget {
    pub team_id: String,
    pub total_budget: f64,
    pub period: BudgetPeriod,
    /// Fraction of budget at which warnings start, in (0, 1)
    pub alert_threshold: f64,
    /// Fraction at which scale-ups are refused, in (alert_threshold, 1]
    pub hard_stop_threshold: f64,
    pub reset_hour: u32,
    /// 0 = Sunday; used by weekly periods
    pub reset_day_of_week: u32,
    /// 1-based; clamped to the month length; used by monthly periods
    pub reset_day_of_month: u32,
    pub currency: String,
}

impl TeamBudget {
    pub fn validate(&self) -> PoolResult<()> {
        if self.total_budget <= 0.0 {
            return Err(self.invalid("total_budget must be positive"));
        }
        if !(0.0..1.0).contains(&self.alert_threshold) || self.alert_threshold == 0.0 {
            return Err(self.invalid("alert_threshold must be in (0, 1)"));
        }
        if self.hard_stop_threshold <= self.alert_threshold || self.hard_stop_threshold > 1.0 {
            return Err(self.invalid("hard_stop_threshold must be in (alert_threshold, 1]"));
        }
        if self.reset_hour > 23 {
            return Err(self.invalid("reset_hour must be in [0, 23]"));
        }
        if self.reset_day_of_week > 6 {
            return Err(self.invalid("reset_day_of_week must be in [0, 6]"));
        }
        if !(1..=31).contains(&self.reset_day_of_month) {
            return Err(self.invalid("reset_day_of_month must be in [1, 31]"));
        }
        Ok(())
    }

    fn invalid(&self, reason: &str) -> PoolError {
        PoolError::ValidationError {
            field: format!("budget:{}", self.team_id),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAlertLevel {
    Info,
    Warning,
    Critical,
    Exceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub team_id: String,
    pub level: BudgetAlertLevel,
    pub current_cost: f64,
    pub total_budget: f64,
    pub percentage_used: f64,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of asking whether a scale command fits the budget
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingCostCheck {
    Allowed { projected_cost: f64 },
    Blocked { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub team_id: String,
    pub current_cost: f64,
    pub total_budget: f64,
    pub percentage_used: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub burn_rate_per_hour: f64,
    pub hours_remaining: f64,
    pub exhaustion_imminent: bool,
    pub currency: String,
}

#[derive(Debug)]
struct BudgetWindow {
    budget: TeamBudget,
    current_cost: f64,
    period_start: DateTime<Utc>,
    last_alert: Option<(BudgetAlertLevel, DateTime<Utc>)>,
}

/// Cost accounting for every budgeted team.
pub struct CostTracker {
    config: CostTrackingConfig,
    windows: Arc<RwLock<HashMap<String, BudgetWindow>>>,
    events: broadcast::Sender<BudgetAlert>,
}

impl CostTracker {
    #[must_use]
    pub fn new(config: CostTrackingConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            windows: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BudgetAlert> {
        self.events.subscribe()
    }

    /// Register (or replace) a team's budget; the period window starts at
    /// the most recent aligned instant.
    pub async fn register_budget(&self, budget: TeamBudget) -> PoolResult<()> {
        budget.validate()?;
        let now = Utc::now();
        let mut windows = self.windows.write().await;
        info!(team_id = %budget.team_id, total = budget.total_budget, "budget registered");
        windows.insert(
            budget.team_id.clone(),
            BudgetWindow {
                period_start: aligned_period_start(&budget, now),
                budget,
                current_cost: 0.0,
                last_alert: None,
            },
        );
        Ok(())
    }

    pub async fn remove_budget(&self, team_id: &str) {
        self.windows.write().await.remove(team_id);
    }

    /// Record the observed cumulative cost for the current period; returns
    /// an alert when a threshold is crossed and not cooled down.
    pub async fn update_cost(
        &self,
        team_id: &str,
        current_cost: f64,
    ) -> PoolResult<Option<BudgetAlert>> {
        self.update_cost_at(team_id, current_cost, Utc::now()).await
    }

    async fn update_cost_at(
        &self,
        team_id: &str,
        current_cost: f64,
        now: DateTime<Utc>,
    ) -> PoolResult<Option<BudgetAlert>> {
        if current_cost < 0.0 {
            return Err(PoolError::ValidationError {
                field: format!("cost:{team_id}"),
                reason: "cost cannot be negative".to_string(),
            });
        }

        let mut windows = self.windows.write().await;
        let Some(window) = windows.get_mut(team_id) else {
            return Ok(None);
        };

        roll_forward(window, now);
        window.current_cost = current_cost;

        let percentage = window.current_cost / window.budget.total_budget;
        let Some(level) = alert_level(&window.budget, percentage) else {
            return Ok(None);
        };

        // Same-level alerts are suppressed within the cooldown.
        if window
            .last_alert
            .is_some_and(|(last, at)| last == level && now - at < ALERT_COOLDOWN)
        {
            return Ok(None);
        }
        window.last_alert = Some((level, now));

        let alert = BudgetAlert {
            team_id: team_id.to_string(),
            level,
            current_cost: window.current_cost,
            total_budget: window.budget.total_budget,
            percentage_used: percentage,
            timestamp: now,
        };
        warn!(
            team_id,
            level = ?level,
            percentage = format!("{:.1}%", percentage * 100.0),
            "budget alert"
        );
        let _ = self.events.send(alert.clone());
        Ok(Some(alert))
    }

    /// Whether the team's utilization has reached the hard-stop threshold.
    pub async fn hard_stop_breached(&self, team_id: &str) -> bool {
        let mut windows = self.windows.write().await;
        let Some(window) = windows.get_mut(team_id) else {
            return false;
        };
        roll_forward(window, Utc::now());
        window.current_cost / window.budget.total_budget >= window.budget.hard_stop_threshold
    }

    /// Project the cost of running `proposed_agents` for `hours` and refuse
    /// the scaling if the projection reaches the hard stop.
    pub async fn should_block_scaling(
        &self,
        team_id: &str,
        proposed_agents: u32,
        hours: f64,
    ) -> ScalingCostCheck {
        let additional = f64::from(proposed_agents) * self.config.cost_per_agent_hour * hours
            + self.config.overhead_cost_per_hour * hours;

        let mut windows = self.windows.write().await;
        let Some(window) = windows.get_mut(team_id) else {
            // Unbudgeted teams are never blocked.
            return ScalingCostCheck::Allowed {
                projected_cost: additional,
            };
        };
        roll_forward(window, Utc::now());

        let projected_total = window.current_cost + additional;
        let ratio = projected_total / window.budget.total_budget;
        if ratio >= window.budget.hard_stop_threshold {
            ScalingCostCheck::Blocked {
                reason: format!(
                    "projected cost {:.2} {} is {:.0}% of budget (hard stop {:.0}%)",
                    projected_total,
                    window.budget.currency,
                    ratio * 100.0,
                    window.budget.hard_stop_threshold * 100.0
                ),
            }
        } else {
            ScalingCostCheck::Allowed {
                projected_cost: additional,
            }
        }
    }

    /// Hourly spend for a pool of the given size.
    #[must_use]
    pub fn burn_rate(&self, current_agents: u32) -> f64 {
        f64::from(current_agents) * self.config.cost_per_agent_hour
            + self.config.overhead_cost_per_hour
    }

    /// Burn-rate report with the time-to-exhaustion estimate.
    pub async fn status(&self, team_id: &str, current_agents: u32) -> Option<BudgetStatus> {
        let mut windows = self.windows.write().await;
        let window = windows.get_mut(team_id)?;
        roll_forward(window, Utc::now());

        let burn = self.burn_rate(current_agents);
        let remaining_budget = (window.budget.total_budget - window.current_cost).max(0.0);
        let hours_remaining = if burn > 0.0 {
            remaining_budget / burn
        } else {
            f64::INFINITY
        };

        Some(BudgetStatus {
            team_id: team_id.to_string(),
            current_cost: window.current_cost,
            total_budget: window.budget.total_budget,
            percentage_used: window.current_cost / window.budget.total_budget,
            period_start: window.period_start,
            period_end: period_end(&window.budget, window.period_start),
            burn_rate_per_hour: burn,
            hours_remaining,
            exhaustion_imminent: hours_remaining < EXHAUSTION_IMMINENT_HOURS,
            currency: window.budget.currency.clone(),
        })
    }
}

/// Reset the window when `now` has passed the period boundary.
fn roll_forward(window: &mut BudgetWindow, now: DateTime<Utc>) {
    if now >= period_end(&window.budget, window.period_start) {
        window.period_start = aligned_period_start(&window.budget, now);
        window.current_cost = 0.0;
        window.last_alert = None;
    }
}

fn alert_level(budget: &TeamBudget, percentage: f64) -> Option<BudgetAlertLevel> {
    if percentage >= 1.0 {
        Some(BudgetAlertLevel::Exceeded)
    } else if percentage >= budget.hard_stop_threshold {
        Some(BudgetAlertLevel::Critical)
    } else if percentage >= budget.alert_threshold {
        Some(BudgetAlertLevel::Warning)
    } else if percentage >= 0.8 * budget.alert_threshold {
        Some(BudgetAlertLevel::Info)
    } else {
        None
    }
}

/// The most recent aligned period boundary at or before `now`.
#[must_use]
pub fn aligned_period_start(budget: &TeamBudget, now: DateTime<Utc>) -> DateTime<Utc> {
    match budget.period {
        BudgetPeriod::Hourly => at_hour(now.year(), now.month(), now.day(), now.hour()),
        BudgetPeriod::Daily => {
            let candidate = at_hour(now.year(), now.month(), now.day(), budget.reset_hour);
            if candidate > now {
                candidate - Duration::days(1)
            } else {
                candidate
            }
        }
        BudgetPeriod::Weekly => {
            let today_dow = now.weekday().num_days_from_sunday();
            let days_back = (today_dow + 7 - budget.reset_day_of_week) % 7;
            let day = now.date_naive() - Duration::days(i64::from(days_back));
            let candidate = at_hour(day.year(), day.month(), day.day(), budget.reset_hour);
            if candidate > now {
                candidate - Duration::days(7)
            } else {
                candidate
            }
        }
        BudgetPeriod::Monthly => {
            let candidate = monthly_boundary(budget, now.year(), now.month());
            if candidate > now {
                let (year, month) = previous_month(now.year(), now.month());
                monthly_boundary(budget, year, month)
            } else {
                candidate
            }
        }
    }
}

/// First boundary strictly after `start`.
#[must_use]
pub fn period_end(budget: &TeamBudget, start: DateTime<Utc>) -> DateTime<Utc> {
    match budget.period {
        BudgetPeriod::Hourly => start + Duration::hours(1),
        BudgetPeriod::Daily => start + Duration::days(1),
        BudgetPeriod::Weekly => start + Duration::days(7),
        BudgetPeriod::Monthly => {
            let (year, month) = next_month(start.year(), start.month());
            monthly_boundary(budget, year, month)
        }
    }
}

fn monthly_boundary(budget: &TeamBudget, year: i32, month: u32) -> DateTime<Utc> {
    let day = budget.reset_day_of_month.min(days_in_month(year, month));
    at_hour(year, month, day, budget.reset_hour)
}

fn at_hour(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = next_month(year, month);
    let first_of_next = at_hour(next_year, next_month, 1, 0);
    (first_of_next - Duration::days(1)).day()
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(period: BudgetPeriod) -> TeamBudget {
        TeamBudget {
            team_id: "t1".to_string(),
            total_budget: 100.0,
            period,
            alert_threshold: 0.7,
            hard_stop_threshold: 0.9,
            reset_hour: 6,
            reset_day_of_week: 1,
            reset_day_of_month: 15,
            currency: "USD".to_string(),
        }
    }

    fn tracker() -> CostTracker {
        CostTracker::new(CostTrackingConfig {
            cost_per_agent_hour: 1.0,
            overhead_cost_per_hour: 0.0,
            currency: "USD".to_string(),
        })
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    #[test]
    fn thresholds_validated_on_registration() {
        let mut bad = budget(BudgetPeriod::Daily);
        bad.hard_stop_threshold = 0.5;
        assert!(bad.validate().is_err());

        let mut bad = budget(BudgetPeriod::Daily);
        bad.alert_threshold = 0.0;
        assert!(bad.validate().is_err());

        assert!(budget(BudgetPeriod::Daily).validate().is_ok());
    }

    #[test]
    fn hourly_alignment_truncates() {
        let b = budget(BudgetPeriod::Hourly);
        assert_eq!(
            aligned_period_start(&b, at(2026, 3, 2, 9, 42)),
            at(2026, 3, 2, 9, 0)
        );
    }

    #[test]
    fn daily_alignment_uses_reset_hour() {
        let b = budget(BudgetPeriod::Daily);
        // Before 06:00 the window began yesterday.
        assert_eq!(
            aligned_period_start(&b, at(2026, 3, 2, 4, 0)),
            at(2026, 3, 1, 6, 0)
        );
        assert_eq!(
            aligned_period_start(&b, at(2026, 3, 2, 9, 0)),
            at(2026, 3, 2, 6, 0)
        );
    }

    #[test]
    fn weekly_alignment_most_recent_boundary() {
        let b = budget(BudgetPeriod::Weekly); // resets Monday 06:00
        // Wednesday 2026-03-04 → previous Monday 2026-03-02.
        assert_eq!(
            aligned_period_start(&b, at(2026, 3, 4, 12, 0)),
            at(2026, 3, 2, 6, 0)
        );
        // Monday 05:00 is before the boundary → previous Monday.
        assert_eq!(
            aligned_period_start(&b, at(2026, 3, 2, 5, 0)),
            at(2026, 2, 23, 6, 0)
        );
    }

    #[test]
    fn monthly_alignment_clamps_day() {
        let mut b = budget(BudgetPeriod::Monthly);
        b.reset_day_of_month = 31;
        // February 2026 has 28 days; the boundary clamps to the 28th.
        assert_eq!(
            aligned_period_start(&b, at(2026, 3, 10, 0, 0)),
            at(2026, 2, 28, 6, 0)
        );
    }

    #[test]
    fn period_end_advances_one_period() {
        let b = budget(BudgetPeriod::Weekly);
        let start = at(2026, 3, 2, 6, 0);
        assert_eq!(period_end(&b, start), at(2026, 3, 9, 6, 0));
    }

    #[tokio::test]
    async fn alert_levels_escalate() {
        let tracker = tracker();
        tracker.register_budget(budget(BudgetPeriod::Daily)).await.unwrap();

        // 0.8 × alert_threshold = 56% → info
        let alert = tracker.update_cost("t1", 56.0).await.unwrap().unwrap();
        assert_eq!(alert.level, BudgetAlertLevel::Info);

        let alert = tracker.update_cost("t1", 70.0).await.unwrap().unwrap();
        assert_eq!(alert.level, BudgetAlertLevel::Warning);

        let alert = tracker.update_cost("t1", 90.0).await.unwrap().unwrap();
        assert_eq!(alert.level, BudgetAlertLevel::Critical);

        let alert = tracker.update_cost("t1", 101.0).await.unwrap().unwrap();
        assert_eq!(alert.level, BudgetAlertLevel::Exceeded);
    }

    #[tokio::test]
    async fn same_level_alert_suppressed_within_cooldown() {
        let tracker = tracker();
        // Midnight reset keeps the fixed mid-day probe times inside one period.
        let mut b = budget(BudgetPeriod::Daily);
        b.reset_hour = 0;
        tracker.register_budget(b).await.unwrap();
        let today = Utc::now().date_naive();
        let now = today
            .and_hms_opt(10, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or_else(Utc::now);

        let first = tracker.update_cost_at("t1", 72.0, now).await.unwrap();
        assert!(first.is_some());

        let suppressed = tracker
            .update_cost_at("t1", 74.0, now + Duration::minutes(10))
            .await
            .unwrap();
        assert!(suppressed.is_none());

        let after_cooldown = tracker
            .update_cost_at("t1", 74.0, now + Duration::minutes(70))
            .await
            .unwrap();
        assert!(after_cooldown.is_some());
    }

    #[tokio::test]
    async fn negative_cost_rejected() {
        let tracker = tracker();
        tracker.register_budget(budget(BudgetPeriod::Daily)).await.unwrap();
        assert!(tracker.update_cost("t1", -1.0).await.is_err());
    }

    #[tokio::test]
    async fn block_at_hard_stop_boundary() {
        let tracker = tracker();
        tracker.register_budget(budget(BudgetPeriod::Daily)).await.unwrap();

        // 90 agent-hours projects exactly to the 90% hard stop.
        let check = tracker.should_block_scaling("t1", 90, 1.0).await;
        assert!(matches!(check, ScalingCostCheck::Blocked { .. }));

        // Just below is allowed.
        let check = tracker.should_block_scaling("t1", 89, 1.0).await;
        assert_eq!(
            check,
            ScalingCostCheck::Allowed {
                projected_cost: 89.0
            }
        );
    }

    #[tokio::test]
    async fn unbudgeted_team_never_blocked() {
        let tracker = tracker();
        let check = tracker.should_block_scaling("ghost", 10_000, 1.0).await;
        assert!(matches!(check, ScalingCostCheck::Allowed { .. }));
    }

    #[tokio::test]
    async fn hard_stop_flag_follows_cost() {
        let tracker = tracker();
        tracker.register_budget(budget(BudgetPeriod::Daily)).await.unwrap();
        assert!(!tracker.hard_stop_breached("t1").await);

        tracker.update_cost("t1", 95.0).await.unwrap();
        assert!(tracker.hard_stop_breached("t1").await);
    }

    #[tokio::test]
    async fn period_roll_resets_cost_and_alerts() {
        let tracker = tracker();
        tracker.register_budget(budget(BudgetPeriod::Hourly)).await.unwrap();
        let now = Utc::now();

        let first = tracker.update_cost_at("t1", 80.0, now).await.unwrap();
        assert!(first.is_some());

        // Two hours later the hourly window has rolled; cost starts fresh
        // and the same alert level fires again.
        let alert = tracker
            .update_cost_at("t1", 80.0, now + Duration::hours(2))
            .await
            .unwrap();
        assert!(alert.is_some());
        let status = tracker.status("t1", 0).await.unwrap();
        assert_eq!(status.current_cost, 80.0);
    }

    #[tokio::test]
    async fn exhaustion_estimate() {
        let tracker = tracker();
        tracker.register_budget(budget(BudgetPeriod::Daily)).await.unwrap();
        tracker.update_cost("t1", 50.0).await.unwrap();

        // 50 remaining at 10/hour → 5 hours, imminent.
        let status = tracker.status("t1", 10).await.unwrap();
        assert!((status.burn_rate_per_hour - 10.0).abs() < 1e-9);
        assert!((status.hours_remaining - 5.0).abs() < 1e-9);
        assert!(status.exhaustion_imminent);

        // Idle pool with no overhead burns nothing.
        let status = tracker.status("t1", 0).await.unwrap();
        assert!(status.hours_remaining.is_infinite());
        assert!(!status.exhaustion_imminent);
    }
}
