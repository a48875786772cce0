//! Per-operation-class circuit breaker
//!
//! ```text
//!   Closed --(threshold consecutive failures)--> Open
//!   Open   --(recovery window elapsed, next call)--> HalfOpen
//!   HalfOpen --(N successes)--> Closed
//!   HalfOpen --(any failure)--> Open
//! ```
//!
//! Admission is check-then-grant under the breaker's mutex, and a half-open
//! breaker admits one probe at a time. The grant is a [`CircuitPermit`]; the
//! outcome is recorded by consuming it. A permit dropped without an outcome
//! (the attempt was cancelled) frees the probe slot without counting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failure threshold exceeded, fast-fail
    Open,
    /// Testing if the operation recovered
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

/// Tuning shared by every breaker created from one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open a closed breaker
    pub threshold: u32,
    /// Time an open breaker refuses calls before allowing a probe
    pub recovery_window: Duration,
    /// Probe successes needed to close a half-open breaker
    pub half_open_successes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            recovery_window: Duration::from_secs(30),
            half_open_successes: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    /// Only meaningful while half-open
    success_count: u32,
    last_failure: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            next_attempt: None,
            probe_in_flight: false,
        }
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub threshold: u32,
    pub last_failure: Option<DateTime<Utc>>,
    /// Time left before an open breaker admits a probe
    pub retry_in: Option<Duration>,
}

/// Circuit breaker for one operation class
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    /// Current state. Does not move an expired open breaker to half-open;
    /// only admission does that.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.lock().success_count
    }

    /// Ask to run one attempt.
    ///
    /// Returns the remaining recovery window when refused.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CircuitPermit, Duration> {
        let now = Instant::now();
        let mut inner = self.lock();

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                // No reopen instant means the window ran past the clock range.
                let Some(next_attempt) = inner.next_attempt else {
                    return Err(Duration::MAX);
                };
                if now < next_attempt {
                    return Err(next_attempt - now);
                }
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                tracing::info!(
                    operation = %self.name,
                    "Circuit breaker half-open, admitting probe"
                );
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(Duration::ZERO);
                }
                true
            }
        };

        if probe {
            inner.probe_in_flight = true;
        }

        Ok(CircuitPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
        })
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        *self.lock() = BreakerState::closed();
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let inner = self.lock();
        let retry_in = match (inner.state, inner.next_attempt) {
            (CircuitState::Open, Some(next)) => Some(next.saturating_duration_since(now)),
            _ => None,
        };
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            threshold: self.settings.threshold,
            last_failure: inner.last_failure,
            retry_in,
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.settings.half_open_successes {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.next_attempt = None;
                    tracing::info!(operation = %self.name, "Circuit breaker closed");
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
        }

        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Utc::now());

        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.settings.threshold => {
                inner.state = CircuitState::Open;
                inner.next_attempt = now.checked_add(self.settings.recovery_window);
                tracing::info!(
                    operation = %self.name,
                    failures = inner.failure_count,
                    recovery_ms = self.settings.recovery_window.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.next_attempt = now.checked_add(self.settings.recovery_window);
                tracing::info!(operation = %self.name, "Probe failed, circuit breaker re-opened");
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    fn release_probe(&self) {
        self.lock().probe_in_flight = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission to run one attempt through a breaker
#[derive(Debug)]
#[must_use = "record the attempt outcome on the permit"]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl CircuitPermit {
    /// True when this permit is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Operation class → breaker table
#[derive(Debug)]
pub struct CircuitBreakers {
    settings: BreakerSettings,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.settings))),
        )
    }

    /// Snapshots of every breaker, ordered by name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|breaker| breaker.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread::sleep;

    fn breaker(threshold: u32, window_ms: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "docker",
            BreakerSettings {
                threshold,
                recovery_window: Duration::from_millis(window_ms),
                half_open_successes: 2,
            },
        ))
    }

    fn fail(cb: &Arc<CircuitBreaker>, times: u32) {
        for _ in 0..times {
            cb.try_acquire().expect("admitted").record_failure();
        }
    }

    #[test]
    fn oversized_window_stays_open_without_panicking() {
        let cb = Arc::new(CircuitBreaker::new(
            "docker",
            BreakerSettings {
                threshold: 1,
                recovery_window: Duration::MAX,
                half_open_successes: 2,
            },
        ));
        fail(&cb, 1);

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.try_acquire().unwrap_err(), Duration::MAX);

        cb.reset();
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn starts_closed() {
        let cb = breaker(5, 30_000);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn opens_at_threshold_and_refuses() {
        let cb = breaker(5, 30_000);
        fail(&cb, 4);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb, 1);
        assert_eq!(cb.state(), CircuitState::Open);

        let retry_in = cb.try_acquire().unwrap_err();
        assert!(retry_in > Duration::from_secs(29), "{retry_in:?}");
    }

    #[test]
    fn success_while_closed_resets_failures() {
        let cb = breaker(3, 30_000);
        fail(&cb, 2);
        cb.try_acquire().unwrap().record_success();
        assert_eq!(cb.failure_count(), 0);

        fail(&cb, 2);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_closes_after_two_successes() {
        let cb = breaker(2, 20);
        fail(&cb, 2);
        sleep(Duration::from_millis(40));

        let probe = cb.try_acquire().expect("probe admitted");
        assert!(probe.is_probe());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        probe.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.success_count(), 1);

        cb.try_acquire().unwrap().record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.success_count(), 0);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_window() {
        let cb = breaker(2, 20);
        fail(&cb, 2);
        sleep(Duration::from_millis(40));

        cb.try_acquire().unwrap().record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());

        let snapshot = cb.snapshot();
        assert!(snapshot.retry_in.is_some());
        assert_eq!(snapshot.success_count, 0);
    }

    #[test]
    fn half_open_admits_one_probe_at_a_time() {
        let cb = breaker(1, 10);
        fail(&cb, 1);
        sleep(Duration::from_millis(30));

        let probe = cb.try_acquire().expect("first probe");
        assert!(cb.try_acquire().is_err(), "second probe must wait");

        probe.record_success();
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn dropped_probe_frees_the_slot_without_counting() {
        let cb = breaker(1, 10);
        fail(&cb, 1);
        sleep(Duration::from_millis(30));

        drop(cb.try_acquire().expect("probe"));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.success_count(), 0);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn concurrent_callers_get_a_single_probe() {
        let cb = breaker(1, 10);
        fail(&cb, 1);
        sleep(Duration::from_millis(30));

        let admitted: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cb = Arc::clone(&cb);
                    scope.spawn(move || cb.try_acquire().map(std::mem::forget).is_ok())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(admitted.iter().filter(|ok| **ok).count(), 1);
    }

    #[test]
    fn reset_closes_immediately() {
        let cb = breaker(1, 30_000);
        fail(&cb, 1);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn table_shares_breakers_per_class() {
        let table = CircuitBreakers::default();
        let a = table.get_or_create("docker");
        let b = table.get_or_create("docker");
        let c = table.get_or_create("git");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(table.get("network").is_none());

        let names: Vec<String> = table.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["docker".to_string(), "git".to_string()]);
    }

    #[test]
    fn state_displays_snake_case() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"half_open\""
        );
    }
}
