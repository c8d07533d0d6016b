//! Per-key circuit breakers.
//!
//! Each key owns one [`CircuitBreakerState`] behind its own lock, so transitions
//! for a key are serialized while different keys never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::breaker::{Admission, BreakerSettings, CircuitBreakerState, CircuitState};

/// The circuit for `key` is open; the attempt was not started.
#[derive(Debug, Clone, Error)]
#[error("circuit open for '{key}' after {consecutive_failures} failures (retry in {}ms)", .retry_in.as_millis())]
pub struct CircuitOpenError {
    pub key: String,
    pub retry_at: Instant,
    pub retry_in: Duration,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
pub struct CircuitBreakers {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, Arc<Mutex<CircuitBreakerState>>>>,
}

impl CircuitBreakers {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    pub fn check(&self, key: &str) -> Result<Admission, CircuitOpenError> {
        self.check_at(key, Instant::now())
    }

    /// Admit or reject an attempt for `key` at `now`.
    pub fn check_at(&self, key: &str, now: Instant) -> Result<Admission, CircuitOpenError> {
        let entry = self.entry(key);
        let mut state = lock(&entry);
        match state.admit(now) {
            Admission::Rejected { retry_at } => {
                debug!(key, failures = state.consecutive_failures, "circuit open, rejecting");
                Err(CircuitOpenError {
                    key: key.to_string(),
                    retry_at,
                    retry_in: retry_at.saturating_duration_since(now),
                    consecutive_failures: state.consecutive_failures,
                })
            }
            Admission::Trial => {
                info!(key, "circuit half-open, allowing trial attempt");
                Ok(Admission::Trial)
            }
            Admission::Allowed => Ok(Admission::Allowed),
        }
    }

    pub fn record_success(&self, key: &str) {
        let entry = self.entry(key);
        let mut state = lock(&entry);
        if state.state != CircuitState::Closed {
            info!(key, "circuit closed after successful trial");
        }
        state.on_success();
    }

    pub fn record_failure(&self, key: &str) {
        self.record_failure_at(key, Instant::now());
    }

    pub fn record_failure_at(&self, key: &str, now: Instant) {
        let entry = self.entry(key);
        let mut state = lock(&entry);
        let before = state.state;
        state.on_failure(now, &self.settings);
        if before != CircuitState::Open && state.state == CircuitState::Open {
            let open_for = state
                .next_retry_at
                .map(|at| at.saturating_duration_since(now))
                .unwrap_or_default();
            warn!(
                key,
                failures = state.consecutive_failures,
                open_ms = open_for.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    /// Give back a half-open trial whose attempt never ran.
    pub fn abandon_trial(&self, key: &str) {
        lock(&self.entry(key)).abandon_trial();
    }

    pub fn snapshot(&self, key: &str) -> CircuitBreakerState {
        lock(&self.entry(key)).clone()
    }

    pub fn reset(&self, key: &str) {
        lock(&self.entry(key)).reset();
    }

    fn entry(&self, key: &str) -> Arc<Mutex<CircuitBreakerState>> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitBreakerState::new(key)))),
        )
    }
}

fn lock(entry: &Mutex<CircuitBreakerState>) -> MutexGuard<'_, CircuitBreakerState> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}
