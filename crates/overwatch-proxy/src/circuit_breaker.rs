//! Circuit breaker for the upstream connection.
//!
//! State machine:
//! ```text
//! Closed --(failure_count >= failure_threshold)--> Open
//! Open --(reset_timeout since last failure)--> HalfOpen
//! HalfOpen --(success_count >= success_threshold)--> Closed
//! HalfOpen --(any failure)--> Open
//! ```
//! No other transitions are reachable. The proxy core owns one breaker per
//! upstream and drives it from its single task, so the struct takes
//! `&mut self` without interior locking.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use overwatch_types::records::CircuitState;

/// Breaker thresholds and timing.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub reset_timeout: Duration,
    /// Successes in half-open required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(60_000),
            success_threshold: 2,
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_trips: u64,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    total_trips: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            total_trips: 0,
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// In `Open`, once `reset_timeout` has elapsed since the last failure the
    /// query itself performs the `Open → HalfOpen` transition and returns
    /// true. Deterministic for a given clock reading.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_time
                    .map(|t| t.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    info!("circuit breaker reset timeout elapsed, transitioning to HalfOpen");
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    info!(
                        successes = self.success_count,
                        "circuit breaker recovered, transitioning to Closed"
                    );
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                }
            }
            CircuitState::Open => {
                // Calls are rejected while open; nothing to account.
                debug!("success recorded while circuit is Open");
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.last_failure_time = Some(Instant::now());
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.total_trips += 1;
                    warn!(
                        failures = self.failure_count,
                        threshold = self.config.failure_threshold,
                        "circuit breaker tripped, transitioning to Open"
                    );
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                self.total_trips += 1;
                warn!("failure while HalfOpen, circuit breaker back to Open");
                self.state = CircuitState::Open;
                self.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to `Closed`, zeroing both counters.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.last_failure_time = None;
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            total_trips: self.total_trips,
        }
    }
}
