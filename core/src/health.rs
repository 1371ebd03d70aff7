//! Subsystem health tracking and circuit breaker (spec §4.S, §9).
//!
//! States flow `ok -> degraded -> suppressed -> recovering -> ok`. Used by
//! the supervisor to decide whether to retry starting a subsystem and by
//! the external health endpoint (out of scope, but this is its data source).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Exponential backoff schedule: `delay(1) = base`, each subsequent delay is
/// `max(previous * factor, base)` capped at `maximum` (spec §B.6).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub maximum: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, factor: f64, maximum: Duration) -> Self {
        Self { base, factor, maximum }
    }

    /// Delay before the `failures`-th retry (1-indexed); `0` for `failures <= 0`.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let mut backoff = self.base;
        for _ in 0..failures.saturating_sub(1) {
            let scaled = backoff.mul_f64(self.factor).max(self.base);
            backoff = scaled.min(self.maximum);
        }
        backoff
    }

    /// Backoff delays for `attempts` total attempts (`attempts - 1` delays
    /// between them); empty for `attempts <= 1`.
    pub fn iter_delays(&self, attempts: u32) -> Vec<Duration> {
        if attempts <= 1 {
            return Vec::new();
        }
        let mut delays = Vec::with_capacity((attempts - 1) as usize);
        let mut backoff = self.base;
        for _ in 0..attempts - 1 {
            delays.push(backoff);
            let scaled = backoff.mul_f64(self.factor).max(self.base);
            backoff = scaled.min(self.maximum);
        }
        delays
    }
}

/// A subsystem's circuit-breaker status, exposed via the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsystemStatus {
    Ok,
    Degraded,
    Suppressed,
    Recovering,
}

impl SubsystemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubsystemStatus::Ok => "ok",
            SubsystemStatus::Degraded => "degraded",
            SubsystemStatus::Suppressed => "suppressed",
            SubsystemStatus::Recovering => "recovering",
        }
    }
}

#[derive(Debug, Clone)]
struct SubsystemState {
    status: SubsystemStatus,
    failures: u32,
    suppressions: u32,
    suppressed_until: Option<Instant>,
    last_error: Option<String>,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
}

impl SubsystemState {
    fn new() -> Self {
        Self {
            status: SubsystemStatus::Ok,
            failures: 0,
            suppressions: 0,
            suppressed_until: None,
            last_error: None,
            last_success: None,
            last_failure: None,
        }
    }
}

/// A point-in-time snapshot of a subsystem's health, safe to hand to an
/// external reporter without holding the monitor's lock.
#[derive(Debug, Clone)]
pub struct SubsystemSnapshot {
    pub name: String,
    pub status: SubsystemStatus,
    pub failures: u32,
    pub suppressions: u32,
    pub suppressed_for: Option<Duration>,
    pub last_error: Option<String>,
}

/// Tracks subsystem health with a simple circuit breaker (spec §4.S).
pub struct HealthMonitor {
    states: Mutex<HashMap<String, SubsystemState>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl HealthMonitor {
    pub fn new(subsystem_names: &[&str], failure_threshold: u32, cooldown: Duration) -> Self {
        let mut states = HashMap::new();
        for name in subsystem_names {
            states.insert((*name).to_string(), SubsystemState::new());
        }
        Self {
            states: Mutex::new(states),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    /// Marks a successful attempt, clearing the failure count and any
    /// suppression.
    pub fn record_success(&self, subsystem: &str) {
        let mut states = self.states.lock();
        let state = states.entry(subsystem.to_string()).or_insert_with(SubsystemState::new);
        state.status = SubsystemStatus::Ok;
        state.failures = 0;
        state.last_error = None;
        state.suppressed_until = None;
        state.last_success = Some(Instant::now());
    }

    /// Records a failure; trips the circuit breaker to `suppressed` once
    /// `failure_threshold` consecutive failures are reached.
    pub fn record_failure(&self, subsystem: &str, error: Option<&str>) {
        let mut states = self.states.lock();
        let state = states.entry(subsystem.to_string()).or_insert_with(SubsystemState::new);
        state.failures += 1;
        let now = Instant::now();
        state.last_failure = Some(now);
        if let Some(err) = error {
            state.last_error = Some(err.to_string());
        }
        if state.failures >= self.failure_threshold {
            state.status = SubsystemStatus::Suppressed;
            state.suppressions += 1;
            state.suppressed_until = Some(now + self.cooldown);
        } else {
            state.status = SubsystemStatus::Degraded;
        }
    }

    /// Returns `(allowed, remaining_cooldown)`. Clears `suppressed` into
    /// `recovering` once the cooldown has elapsed (the caller's next success
    /// or failure finalizes the transition).
    pub fn allow_attempt(&self, subsystem: &str) -> (bool, Duration) {
        let mut states = self.states.lock();
        let state = states.entry(subsystem.to_string()).or_insert_with(SubsystemState::new);
        let now = Instant::now();
        if let Some(until) = state.suppressed_until {
            if until > now {
                return (false, until - now);
            }
        }
        if state.status == SubsystemStatus::Suppressed {
            state.status = SubsystemStatus::Recovering;
        }
        (true, Duration::ZERO)
    }

    /// Returns a snapshot of every tracked subsystem's health.
    pub fn snapshot(&self) -> Vec<SubsystemSnapshot> {
        let states = self.states.lock();
        let now = Instant::now();
        states
            .iter()
            .map(|(name, state)| SubsystemSnapshot {
                name: name.clone(),
                status: state.status,
                failures: state.failures,
                suppressions: state.suppressions,
                suppressed_for: state.suppressed_until.map(|until| until.saturating_duration_since(now)),
                last_error: state.last_error.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_is_zero_for_no_failures() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(5));
        assert_eq!(policy.delay(0), Duration::ZERO);
    }

    #[test]
    fn backoff_delay_grows_geometrically_and_caps_at_maximum() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_millis(350));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
        assert_eq!(policy.delay(4), Duration::from_millis(350));
    }

    #[test]
    fn iter_delays_matches_delay_at_each_step() {
        let policy = BackoffPolicy::new(Duration::from_millis(50), 3.0, Duration::from_secs(1));
        let delays = policy.iter_delays(4);
        assert_eq!(delays.len(), 3);
        assert_eq!(delays[0], policy.delay(1));
        assert_eq!(delays[1], policy.delay(2));
        assert_eq!(delays[2], policy.delay(3));
    }

    #[test]
    fn circuit_breaker_suppresses_after_threshold_failures() {
        let monitor = HealthMonitor::new(&["delivery"], 3, Duration::from_millis(500));
        monitor.record_failure("delivery", Some("boom"));
        monitor.record_failure("delivery", Some("boom"));
        let (allowed, _) = monitor.allow_attempt("delivery");
        assert!(allowed);

        monitor.record_failure("delivery", Some("boom"));
        let (allowed, remaining) = monitor.allow_attempt("delivery");
        assert!(!allowed);
        assert!(remaining > Duration::ZERO);
    }

    #[test]
    fn success_resets_failure_count() {
        let monitor = HealthMonitor::new(&["ingest"], 2, Duration::from_millis(100));
        monitor.record_failure("ingest", None);
        monitor.record_success("ingest");
        let snapshot = monitor.snapshot();
        let ingest = snapshot.iter().find(|s| s.name == "ingest").unwrap();
        assert_eq!(ingest.failures, 0);
        assert_eq!(ingest.status, SubsystemStatus::Ok);
    }
}
