//! Per-server circuit breaker.
//!
//! Closed → Open after `failure_threshold` consecutive failures. Open rejects calls until
//! `recovery_timeout` elapses, then Half-Open admits `half_open_max_calls` trial calls: a trial
//! success closes the circuit, a trial failure opens it again.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    pub enabled: bool,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Time left before an open circuit admits a trial call.
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    options: CircuitBreakerOptions,
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    half_open_calls: u32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        Self {
            name: name.into(),
            options,
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            half_open_calls: 0,
        }
    }

    pub fn set_options(&mut self, options: CircuitBreakerOptions) {
        if !options.enabled {
            self.reset();
        }
        self.options = options;
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Admit a call, or return how long until the circuit will admit one.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        if !self.options.enabled {
            return Ok(());
        }

        if self.state == CircuitState::Open {
            let remaining = self.remaining_open();
            if !remaining.is_zero() {
                return Err(remaining);
            }
            self.state = CircuitState::HalfOpen;
            self.half_open_calls = 0;
            info!(server = %self.name, "circuit half-open, admitting a trial call");
        }

        if self.state == CircuitState::HalfOpen {
            if self.half_open_calls >= self.options.half_open_max_calls {
                return Err(Duration::ZERO);
            }
            self.half_open_calls += 1;
        }
        Ok(())
    }

    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            info!(server = %self.name, "circuit closed after a successful trial call");
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.half_open_calls = 0;
    }

    pub fn record_failure(&mut self) {
        if !self.options.enabled {
            return;
        }
        self.failure_count = self.failure_count.saturating_add(1);
        match self.state {
            CircuitState::HalfOpen => self.open(),
            CircuitState::Closed if self.failure_count >= self.options.failure_threshold => self.open(),
            _ => {}
        }
    }

    /// Back to Closed with no recorded failures.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
        self.half_open_calls = 0;
    }

    pub fn status(&self) -> CircuitStatus {
        let retry_in_ms = (self.state == CircuitState::Open).then(|| self.remaining_open().as_millis() as u64);
        CircuitStatus {
            enabled: self.options.enabled,
            state: self.state,
            failure_count: self.failure_count,
            retry_in_ms,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_calls = 0;
        warn!(
            server = %self.name,
            failures = self.failure_count,
            "circuit opened for {:?}", self.options.recovery_timeout
        );
    }

    fn remaining_open(&self) -> Duration {
        self.opened_at
            .map(|opened| self.options.recovery_timeout.saturating_sub(opened.elapsed()))
            .unwrap_or_default()
    }
}
