//! Recovery policy for transient registry and classical-channel errors.
//!
//! Registry contention (two processes racing for the same lock) and peer
//! connect failures (the listener side hasn't bound yet) are expected,
//! recoverable conditions, not reasons to tear down a QPU process. This
//! module gives callers a retry-with-backoff helper and a per-peer circuit
//! breaker so a QPU stops hammering a peer that's actually down instead of
//! retrying forever.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::logging::{log_error, log_warn, LogCategory};
use crate::QpuMeshError;

/// Open/closed/half-open state of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration for a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

/// Per-peer failure tracker. A peer that fails `failure_threshold` times
/// within `failure_window` trips to `Open` and is refused further attempts
/// until `recovery_timeout` elapses, at which point it gets one `HalfOpen`
/// probe; `success_threshold` consecutive successes close it again.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: parking_lot::Mutex<CircuitState>,
    failures: parking_lot::Mutex<Vec<Instant>>,
    half_open_successes: std::sync::atomic::AtomicU32,
    opened_at: parking_lot::Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: parking_lot::Mutex::new(CircuitState::Closed),
            failures: parking_lot::Mutex::new(Vec::new()),
            half_open_successes: std::sync::atomic::AtomicU32::new(0),
            opened_at: parking_lot::Mutex::new(None),
        }
    }

    /// Whether a call through this breaker should be attempted right now.
    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = *self.opened_at.lock();
                if let Some(t) = opened_at {
                    if t.elapsed() >= self.config.recovery_timeout {
                        *state = CircuitState::HalfOpen;
                        self.half_open_successes
                            .store(0, std::sync::atomic::Ordering::Relaxed);
                        return true;
                    }
                }
                false
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match *state {
            CircuitState::HalfOpen => {
                let successes = self
                    .half_open_successes
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    + 1;
                if successes >= self.config.success_threshold {
                    *state = CircuitState::Closed;
                    self.failures.lock().clear();
                }
            }
            CircuitState::Closed => {
                self.failures.lock().clear();
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        match *state {
            CircuitState::HalfOpen => {
                *state = CircuitState::Open;
                *self.opened_at.lock() = Some(now);
            }
            CircuitState::Closed => {
                let mut failures = self.failures.lock();
                failures.retain(|t| now.duration_since(*t) <= self.config.failure_window);
                failures.push(now);
                if failures.len() as u32 >= self.config.failure_threshold {
                    *state = CircuitState::Open;
                    *self.opened_at.lock() = Some(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.lock()
    }
}

/// Exponential backoff with jitter for registry lock contention and peer
/// connect retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt number `attempt` (0-indexed), with deterministic
    /// jitter derived from the attempt number rather than `rand` — this
    /// module has no source of entropy and doesn't need one for backoff.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = capped * self.jitter_factor * (((attempt % 7) as f64) / 7.0);
        Duration::from_secs_f64(capped + jitter)
    }
}

/// Per-peer error bookkeeping and recovery policy.
pub struct ErrorHandler {
    breakers: DashMap<String, CircuitBreaker>,
    breaker_config: CircuitBreakerConfig,
    retry_config: RetryConfig,
    error_counts: DashMap<String, u64>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default(), RetryConfig::default())
    }

    pub fn with_config(breaker_config: CircuitBreakerConfig, retry_config: RetryConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            breaker_config,
            retry_config,
            error_counts: DashMap::new(),
        }
    }

    fn breaker_for(&self, peer: &str) -> dashmap::mapref::one::Ref<'_, String, CircuitBreaker> {
        self.breakers
            .entry(peer.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config));
        self.breakers.get(peer).expect("just inserted")
    }

    /// Whether `peer` should be contacted right now.
    pub fn is_peer_available(&self, peer: &str) -> bool {
        self.breaker_for(peer).can_execute()
    }

    /// Record the outcome of an attempt against `peer`, updating its circuit
    /// breaker and the aggregate error counter.
    pub fn record_outcome(&self, peer: &str, result: &Result<(), QpuMeshError>) {
        let breaker = self.breaker_for(peer);
        match result {
            Ok(()) => breaker.record_success(),
            Err(e) => {
                breaker.record_failure();
                *self.error_counts.entry(peer.to_string()).or_insert(0) += 1;
                log_error(LogCategory::Network, &format!("{peer}: {e}"));
                if breaker.state() == CircuitState::Open {
                    log_warn(
                        LogCategory::Network,
                        &format!("circuit breaker opened for peer {peer}"),
                    );
                }
            }
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry_config
    }

    pub fn error_counts(&self) -> HashMap<String, u64> {
        self.error_counts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}
