//! Failure-aware gating for outbound calls.
//!
//! Each named circuit tracks failures and successes in a rolling monitoring
//! window and moves between `closed`, `open`, and `half_open`. Recovery
//! attempts and external-service integrations run their calls through a
//! circuit so a struggling upstream is probed, not hammered.

use crate::utils::config::CircuitBreakerConfig;
use crate::utils::error::{PoolError, PoolResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Events emitted by a circuit; the registry forwards them upward unchanged.
#[derive(Debug, Clone)]
pub enum CircuitEvent {
    StateChanged {
        name: String,
        from: CircuitState,
        to: CircuitState,
        reason: String,
    },
    Opened { name: String },
    Closed { name: String },
    HalfOpen { name: String },
    Success { name: String },
    Failure { name: String },
    FallbackUsed { name: String },
}

/// Rolling metrics snapshot for one circuit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub successes_in_window: usize,
    pub failure_rate: f64,
    pub throughput_per_sec: f64,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub open_transitions: u64,
    pub consecutive_successes: u32,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    /// Bumped on every transition so a stale scheduled probe cannot fire
    epoch: u64,
    failures: VecDeque<Instant>,
    successes: VecDeque<Instant>,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    open_transitions: u64,
    total_calls: u64,
    rejected_calls: u64,
}

enum Admission {
    Normal,
    /// Half-open call holding one of the limited probe slots
    Probe,
}

/// Per-service three-state gate. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitInner>>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name: Arc::from(name.into()),
            config,
            inner: Arc::new(Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                epoch: 0,
                failures: VecDeque::new(),
                successes: VecDeque::new(),
                consecutive_successes: 0,
                half_open_in_flight: 0,
                opened_at: None,
                open_transitions: 0,
                total_calls: 0,
                rejected_calls: 0,
            })),
            events,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    /// Run an async operation through the gate.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> PoolResult<T>
    where
        E: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.try_acquire()?;
        let result = op().await;
        self.settle(&admission, result.is_ok());
        result.map_err(|e| PoolError::OperationFailed {
            reason: e.to_string(),
        })
    }

    /// Run an async operation; when the gate rejects the call or the primary
    /// fails, run the fallback instead. A fallback failure carries the
    /// original cause alongside its own.
    pub async fn execute_with_fallback<T, E, E2, F, Fut, FB, FutB>(
        &self,
        op: F,
        fallback: FB,
    ) -> PoolResult<T>
    where
        E: std::fmt::Display,
        E2: std::fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> FutB,
        FutB: Future<Output = Result<T, E2>>,
    {
        let admission = match self.try_acquire() {
            Ok(admission) => admission,
            Err(rejection) => {
                self.emit(CircuitEvent::FallbackUsed {
                    name: self.name.to_string(),
                });
                return fallback().await.map_err(|e| PoolError::FallbackFailed {
                    original: rejection.to_string(),
                    fallback: e.to_string(),
                });
            }
        };

        match op().await {
            Ok(value) => {
                self.settle(&admission, true);
                Ok(value)
            }
            Err(primary) => {
                self.settle(&admission, false);
                self.emit(CircuitEvent::FallbackUsed {
                    name: self.name.to_string(),
                });
                fallback().await.map_err(|e| PoolError::FallbackFailed {
                    original: primary.to_string(),
                    fallback: e.to_string(),
                })
            }
        }
    }

    /// Synchronous variant of [`execute`](Self::execute) for callers outside
    /// an async context.
    pub fn execute_sync<T, E, F>(&self, op: F) -> PoolResult<T>
    where
        E: std::fmt::Display,
        F: FnOnce() -> Result<T, E>,
    {
        let admission = self.try_acquire()?;
        let result = op();
        self.settle(&admission, result.is_ok());
        result.map_err(|e| PoolError::OperationFailed {
            reason: e.to_string(),
        })
    }

    /// Admit or reject a call under the current state.
    fn try_acquire(&self) -> PoolResult<Admission> {
        let mut inner = self.lock_inner();
        self.prune_windows(&mut inner);

        if inner.state == CircuitState::Open {
            let elapsed_reset = inner
                .opened_at
                .is_some_and(|at| at.elapsed() >= Duration::from_millis(self.config.reset_timeout_ms));
            if self.config.auto_recovery && elapsed_reset {
                self.transition(&mut inner, CircuitState::HalfOpen, "reset_timeout");
            } else {
                inner.rejected_calls += 1;
                return Err(self.rejection(inner.state));
            }
        }

        match inner.state {
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    inner.rejected_calls += 1;
                    return Err(self.rejection(inner.state));
                }
                inner.half_open_in_flight += 1;
                inner.total_calls += 1;
                Ok(Admission::Probe)
            }
            CircuitState::Closed => {
                inner.total_calls += 1;
                Ok(Admission::Normal)
            }
            CircuitState::Open => Err(self.rejection(CircuitState::Open)),
        }
    }

    /// Record the outcome of an admitted call and drive state transitions.
    fn settle(&self, admission: &Admission, success: bool) {
        let mut inner = self.lock_inner();
        if matches!(admission, Admission::Probe) {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        let now = Instant::now();
        self.prune_windows(&mut inner);

        if success {
            inner.successes.push_back(now);
            self.emit(CircuitEvent::Success {
                name: self.name.to_string(),
            });
            if inner.state == CircuitState::HalfOpen {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.failures.clear();
                    self.transition(&mut inner, CircuitState::Closed, "probe_successes");
                }
            }
        } else {
            inner.failures.push_back(now);
            self.emit(CircuitEvent::Failure {
                name: self.name.to_string(),
            });
            match inner.state {
                CircuitState::HalfOpen => {
                    self.transition(&mut inner, CircuitState::Open, "probe_failure");
                }
                CircuitState::Closed => {
                    if inner.failures.len() >= self.config.failure_threshold {
                        self.transition(&mut inner, CircuitState::Open, "failure_threshold");
                    }
                }
                CircuitState::Open => {}
            }
        }
    }

    /// Apply a transition, emit events, and schedule the half-open probe when
    /// entering `open` with auto-recovery on.
    fn transition(&self, inner: &mut CircuitInner, to: CircuitState, reason: &str) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.epoch += 1;

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.open_transitions += 1;
                inner.consecutive_successes = 0;
                inner.half_open_in_flight = 0;
                warn!(circuit = %self.name, %from, reason, "circuit opened");
                self.emit(CircuitEvent::Opened {
                    name: self.name.to_string(),
                });
                if self.config.auto_recovery && reason != "manual" {
                    self.schedule_half_open(inner.epoch);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes = 0;
                inner.half_open_in_flight = 0;
                debug!(circuit = %self.name, "circuit half-open, probing");
                self.emit(CircuitEvent::HalfOpen {
                    name: self.name.to_string(),
                });
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.consecutive_successes = 0;
                inner.half_open_in_flight = 0;
                info!(circuit = %self.name, "circuit closed");
                self.emit(CircuitEvent::Closed {
                    name: self.name.to_string(),
                });
            }
        }

        self.emit(CircuitEvent::StateChanged {
            name: self.name.to_string(),
            from,
            to,
            reason: reason.to_string(),
        });
    }

    /// Move to half-open after the reset timeout unless the circuit has
    /// transitioned again in the meantime.
    fn schedule_half_open(&self, epoch_at_open: u64) {
        let breaker = self.clone();
        let delay = Duration::from_millis(self.config.reset_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = breaker.lock_inner();
            if inner.state == CircuitState::Open && inner.epoch == epoch_at_open {
                breaker.transition(&mut inner, CircuitState::HalfOpen, "reset_timeout");
            }
        });
    }

    pub fn force_open(&self) {
        let mut inner = self.lock_inner();
        self.transition(&mut inner, CircuitState::Open, "manual");
    }

    pub fn force_close(&self) {
        let mut inner = self.lock_inner();
        self.transition(&mut inner, CircuitState::Closed, "manual");
    }

    /// Clear counters and windows; the circuit stays registered.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        inner.failures.clear();
        inner.successes.clear();
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
        self.transition(&mut inner, CircuitState::Closed, "manual");
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock_inner().state
    }

    #[must_use]
    pub fn metrics(&self) -> CircuitMetrics {
        let mut inner = self.lock_inner();
        self.prune_windows(&mut inner);
        let failures = inner.failures.len();
        let successes = inner.successes.len();
        let window_calls = failures + successes;
        let window_secs = Duration::from_millis(self.config.monitoring_window_ms).as_secs_f64();
        CircuitMetrics {
            name: self.name.to_string(),
            state: inner.state,
            failures_in_window: failures,
            successes_in_window: successes,
            failure_rate: if window_calls > 0 {
                failures as f64 / window_calls as f64
            } else {
                0.0
            },
            throughput_per_sec: if window_secs > 0.0 {
                window_calls as f64 / window_secs
            } else {
                0.0
            },
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            open_transitions: inner.open_transitions,
            consecutive_successes: inner.consecutive_successes,
        }
    }

    fn prune_windows(&self, inner: &mut CircuitInner) {
        let window = Duration::from_millis(self.config.monitoring_window_ms);
        let Some(cutoff) = Instant::now().checked_sub(window) else {
            return;
        };
        while inner.failures.front().is_some_and(|t| *t < cutoff) {
            inner.failures.pop_front();
        }
        while inner.successes.front().is_some_and(|t| *t < cutoff) {
            inner.successes.pop_front();
        }
    }

    fn rejection(&self, state: CircuitState) -> PoolError {
        PoolError::CircuitOpen {
            name: self.name.to_string(),
            state: state.to_string(),
        }
    }

    fn emit(&self, event: CircuitEvent) {
        // Nobody subscribed is fine; events are best-effort observability.
        let _ = self.events.send(event);
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Named map of circuits with event fan-out to a single channel.
pub struct CircuitRegistry {
    circuits: DashMap<String, CircuitBreaker>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            circuits: DashMap::new(),
            events,
        }
    }

    /// Idempotent: an existing circuit wins and the supplied config is
    /// ignored. Config applies on create only.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        let entry = self.circuits.entry(name.to_string()).or_insert_with(|| {
            let breaker = CircuitBreaker::new(name, config);
            self.forward_events(&breaker);
            breaker
        });
        entry.clone()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.circuits.get(name).map(|entry| entry.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.circuits.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn by_state(&self, state: CircuitState) -> Vec<String> {
        self.circuits
            .iter()
            .filter(|e| e.value().state() == state)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn force_open_all(&self) {
        for entry in &self.circuits {
            entry.value().force_open();
        }
    }

    pub fn force_close_all(&self) {
        for entry in &self.circuits {
            entry.value().force_close();
        }
    }

    pub fn reset_all(&self) {
        for entry in &self.circuits {
            entry.value().reset();
        }
    }

    /// Forward a child circuit's events to the registry channel, preserving
    /// the child's emission order.
    fn forward_events(&self, breaker: &CircuitBreaker) {
        let mut rx = breaker.subscribe();
        let parent = self.events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = parent.send(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "registry event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            reset_timeout_ms: 50,
            monitoring_window_ms: 60_000,
            half_open_max_calls: 1,
            auto_recovery: true,
        }
    }

    #[tokio::test]
    async fn closed_circuit_passes_calls() {
        let cb = CircuitBreaker::new("svc", fast_config());
        let result = cb.execute(|| async { Ok::<_, PoolError>(42) }).await;
        assert_eq!(result.ok(), Some(42));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let cb = CircuitBreaker::new("svc", fast_config());
        for _ in 0..2 {
            let _ = cb.execute(|| async { Err::<i32, _>("boom") }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Next call is rejected before the reset timeout elapses.
        let result = cb.execute(|| async { Ok::<_, PoolError>(1) }).await;
        assert_matches!(result, Err(PoolError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let cb = CircuitBreaker::new("svc", fast_config());
        for _ in 0..2 {
            let _ = cb.execute(|| async { Err::<i32, _>("boom") }).await;
        }
        sleep(Duration::from_millis(80)).await;

        // Two consecutive probe successes close the circuit.
        for _ in 0..2 {
            let result = cb.execute(|| async { Ok::<_, PoolError>(1) }).await;
            assert!(result.is_ok());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new("svc", fast_config());
        for _ in 0..2 {
            let _ = cb.execute(|| async { Err::<i32, _>("boom") }).await;
        }
        sleep(Duration::from_millis(80)).await;

        let _ = cb.execute(|| async { Err::<i32, _>("still down") }).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_limits_concurrent_probes() {
        let cb = CircuitBreaker::new("svc", fast_config());
        for _ in 0..2 {
            let _ = cb.execute(|| async { Err::<i32, _>("boom") }).await;
        }
        sleep(Duration::from_millis(80)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(move || async move {
                    let _ = release_rx.await;
                    Ok::<_, PoolError>(1)
                })
                .await
            })
        };
        sleep(Duration::from_millis(20)).await;

        // The single probe slot is taken; the second call is rejected.
        let rejected = cb.execute(|| async { Ok::<_, PoolError>(2) }).await;
        assert_matches!(rejected, Err(PoolError::CircuitOpen { .. }));

        let _ = release_tx.send(());
        let first = slow.await;
        assert!(matches!(first, Ok(Ok(1))));
    }

    #[tokio::test]
    async fn fallback_runs_when_open() {
        let cb = CircuitBreaker::new("svc", fast_config());
        cb.force_open();

        let result = cb
            .execute_with_fallback(
                || async { Ok::<_, PoolError>("primary") },
                || async { Ok::<_, PoolError>("fallback") },
            )
            .await;
        assert_eq!(result.ok(), Some("fallback"));
    }

    #[tokio::test]
    async fn fallback_error_carries_both_causes() {
        let cb = CircuitBreaker::new("svc", fast_config());
        let result = cb
            .execute_with_fallback(
                || async { Err::<i32, _>("primary down") },
                || async { Err::<i32, _>("fallback down") },
            )
            .await;
        match result {
            Err(PoolError::FallbackFailed { original, fallback }) => {
                assert_eq!(original, "primary down");
                assert_eq!(fallback, "fallback down");
            }
            other => panic!("expected FallbackFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_sync_gates_like_async() {
        let cb = CircuitBreaker::new("svc", fast_config());
        assert_eq!(cb.execute_sync(|| Ok::<_, PoolError>(7)).ok(), Some(7));

        cb.force_open();
        assert_matches!(
            cb.execute_sync(|| Ok::<_, PoolError>(7)),
            Err(PoolError::CircuitOpen { .. })
        );
    }

    #[tokio::test]
    async fn force_open_then_close_zeroes_counters() {
        let cb = CircuitBreaker::new("svc", fast_config());
        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().consecutive_successes, 0);
    }

    #[tokio::test]
    async fn manual_transitions_emit_state_changed() {
        let cb = CircuitBreaker::new("svc", fast_config());
        let mut rx = cb.subscribe();
        cb.force_open();

        let mut saw_manual = false;
        while let Ok(event) = rx.try_recv() {
            if let CircuitEvent::StateChanged { reason, .. } = event {
                if reason == "manual" {
                    saw_manual = true;
                }
            }
        }
        assert!(saw_manual);
    }

    #[tokio::test]
    async fn registry_get_or_create_is_idempotent() {
        let registry = CircuitRegistry::new();
        let first = registry.get_or_create("svc", fast_config());

        let other_config = CircuitBreakerConfig {
            failure_threshold: 99,
            ..fast_config()
        };
        let second = registry.get_or_create("svc", other_config);

        // Same underlying circuit; the second config was ignored.
        first.force_open();
        assert_eq!(second.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn registry_bulk_operations() {
        let registry = CircuitRegistry::new();
        registry.get_or_create("a", fast_config());
        registry.get_or_create("b", fast_config());

        registry.force_open_all();
        assert_eq!(registry.by_state(CircuitState::Open).len(), 2);

        registry.force_close_all();
        assert_eq!(registry.by_state(CircuitState::Closed).len(), 2);
    }

    #[tokio::test]
    async fn registry_forwards_child_events() {
        let registry = CircuitRegistry::new();
        let mut rx = registry.subscribe();
        let cb = registry.get_or_create("svc", fast_config());

        cb.force_open();
        // The forward task runs on the same runtime; yield until it drains.
        let mut opened = false;
        for _ in 0..50 {
            sleep(Duration::from_millis(5)).await;
            while let Ok(event) = rx.try_recv() {
                if matches!(event, CircuitEvent::Opened { ref name } if name == "svc") {
                    opened = true;
                }
            }
            if opened {
                break;
            }
        }
        assert!(opened);
    }

    #[tokio::test]
    async fn metrics_reflect_window() {
        let cb = CircuitBreaker::new("svc", fast_config());
        let _ = cb.execute(|| async { Ok::<_, PoolError>(1) }).await;
        let _ = cb.execute(|| async { Err::<i32, _>("boom") }).await;

        let metrics = cb.metrics();
        assert_eq!(metrics.total_calls, 2);
        assert_eq!(metrics.failures_in_window, 1);
        assert_eq!(metrics.successes_in_window, 1);
        assert!((metrics.failure_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn open_counts_rejections() {
        let cb = CircuitBreaker::new("svc", fast_config());
        cb.force_open();
        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let _ = cb
                .execute(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, PoolError>(())
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cb.metrics().rejected_calls, 3);
    }
}
