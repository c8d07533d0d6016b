//! Circuit breaker state machine for a single key.
//!
//! Pure transitions over caller-supplied instants so behavior is reproducible in
//! tests. Locking and the per-key map live in [`crate::breaker`].

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::budget::deadline_after;

/// Circuit state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Fast-reject until the retry time passes.
    Open,
    /// One trial attempt allowed.
    HalfOpen,
}

/// How the reset timeout grows when a half-open trial fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

/// Breaker tuning shared by every key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub backoff: Backoff,
    pub max_reset_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            backoff: Backoff::Exponential,
            max_reset_timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl BreakerSettings {
    /// Open duration after `reopens` failed half-open trials.
    pub fn open_duration(&self, reopens: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.reset_timeout,
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(reopens.min(16)).unwrap_or(u32::MAX);
                self.reset_timeout
                    .checked_mul(factor)
                    .unwrap_or(self.max_reset_timeout)
                    .min(self.max_reset_timeout.max(self.reset_timeout))
            }
        }
    }
}

/// Decision for an attempt under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed.
    Allowed,
    /// First attempt after the open window; the outcome decides the next state.
    Trial,
    /// Circuit open (or a trial already in flight).
    Rejected { retry_at: Instant },
}

/// Breaker bookkeeping for one key. Created lazily, reset but never removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
    pub next_retry_at: Option<Instant>,
    /// Failed half-open trials since the circuit last closed.
    pub reopens: u32,
    trial_in_flight: bool,
}

impl CircuitBreakerState {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            next_retry_at: None,
            reopens: 0,
            trial_in_flight: false,
        }
    }

    /// Decide whether an attempt may start at `now`.
    ///
    /// Rejections leave the failure counter untouched.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let retry_at = self.next_retry_at.unwrap_or(now);
                if now < retry_at {
                    return Admission::Rejected { retry_at };
                }
                self.state = CircuitState::HalfOpen;
                self.trial_in_flight = true;
                Admission::Trial
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    Admission::Rejected {
                        retry_at: self.next_retry_at.unwrap_or(now),
                    }
                } else {
                    self.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.next_retry_at = None;
        self.reopens = 0;
        self.trial_in_flight = false;
    }

    pub fn on_failure(&mut self, now: Instant, settings: &BreakerSettings) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= settings.failure_threshold {
                    self.state = CircuitState::Open;
                    self.next_retry_at = Some(deadline_after(now, settings.open_duration(0)));
                }
            }
            CircuitState::HalfOpen => {
                self.reopens = self.reopens.saturating_add(1);
                self.state = CircuitState::Open;
                self.next_retry_at = Some(deadline_after(now, settings.open_duration(self.reopens)));
                self.trial_in_flight = false;
            }
            // Late result from an attempt admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    /// Release a trial slot whose attempt never produced an outcome.
    pub fn abandon_trial(&mut self) {
        self.trial_in_flight = false;
    }

    /// Return to `closed` with a clean counter.
    pub fn reset(&mut self) {
        self.on_success();
        self.last_failure_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(10),
            backoff: Backoff::Exponential,
            max_reset_timeout: Duration::from_secs(60),
        }
    }

    fn tripped(now: Instant) -> CircuitBreakerState {
        let cfg = settings(3);
        let mut state = CircuitBreakerState::new("ns1");
        for _ in 0..3 {
            assert_eq!(state.admit(now), Admission::Allowed);
            state.on_failure(now, &cfg);
        }
        state
    }

    #[test]
    fn success_in_closed_resets_counter() {
        let now = Instant::now();
        let mut state = CircuitBreakerState::new("k");
        state.on_failure(now, &settings(3));
        state.on_failure(now, &settings(3));
        state.on_success();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn opens_at_threshold_and_rejects_without_counting() {
        let now = Instant::now();
        let mut state = tripped(now);
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.next_retry_at, Some(now + Duration::from_secs(10)));

        let admission = state.admit(now + Duration::from_secs(1));
        assert_eq!(
            admission,
            Admission::Rejected {
                retry_at: now + Duration::from_secs(10)
            }
        );
        assert_eq!(state.consecutive_failures, 3);
    }

    #[test]
    fn first_attempt_after_window_is_a_trial() {
        let now = Instant::now();
        let mut state = tripped(now);
        let later = now + Duration::from_secs(10);
        assert_eq!(state.admit(later), Admission::Trial);
        assert_eq!(state.state, CircuitState::HalfOpen);
        // Only one trial at a time.
        assert!(matches!(state.admit(later), Admission::Rejected { .. }));
    }

    #[test]
    fn trial_success_closes() {
        let now = Instant::now();
        let mut state = tripped(now);
        state.admit(now + Duration::from_secs(11));
        state.on_success();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.admit(now), Admission::Allowed);
    }

    #[test]
    fn trial_failure_reopens_with_exponential_backoff() {
        let now = Instant::now();
        let cfg = settings(3);
        let mut state = tripped(now);
        let trial_at = now + Duration::from_secs(10);
        state.admit(trial_at);
        state.on_failure(trial_at, &cfg);
        assert_eq!(state.state, CircuitState::Open);
        assert_eq!(state.consecutive_failures, 4);
        assert_eq!(state.next_retry_at, Some(trial_at + Duration::from_secs(20)));
    }

    #[test]
    fn backoff_is_capped() {
        let cfg = settings(1);
        assert_eq!(cfg.open_duration(0), Duration::from_secs(10));
        assert_eq!(cfg.open_duration(2), Duration::from_secs(40));
        assert_eq!(cfg.open_duration(3), Duration::from_secs(60));
        assert_eq!(cfg.open_duration(40), Duration::from_secs(60));

        let fixed = BreakerSettings {
            backoff: Backoff::Fixed,
            ..cfg
        };
        assert_eq!(fixed.open_duration(5), Duration::from_secs(10));
    }

    #[test]
    fn reset_closes_open_circuit() {
        let now = Instant::now();
        let mut state = tripped(now);
        state.reset();
        assert_eq!(state.state, CircuitState::Closed);
        assert_eq!(state.admit(now), Admission::Allowed);
    }

    #[test]
    fn huge_reset_timeout_keeps_circuit_open() {
        let now = Instant::now();
        let cfg = BreakerSettings {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(u64::MAX),
            backoff: Backoff::Fixed,
            max_reset_timeout: Duration::from_millis(u64::MAX),
        };
        let mut state = CircuitBreakerState::new("k");
        state.on_failure(now, &cfg);
        assert_eq!(state.state, CircuitState::Open);
        assert!(matches!(
            state.admit(now + Duration::from_secs(3600)),
            Admission::Rejected { .. }
        ));
    }
}
