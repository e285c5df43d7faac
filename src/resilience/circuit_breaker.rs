use crate::config::serde_secs;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub failure_count: u32,
    pub success_count: u32,
    /// Remaining time before a probe is let through, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "serde_secs")]
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of failures that opens the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open before a probe is allowed
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set the number of half-open successes that closes the circuit
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::validation_with_context(
                "failure_threshold must be at least 1",
                ErrorContext::new()
                    .with_field_path("circuit_breaker.failure_threshold")
                    .with_source("circuit_breaker"),
            ));
        }
        if self.success_threshold == 0 {
            return Err(Error::validation_with_context(
                "success_threshold must be at least 1",
                ErrorContext::new()
                    .with_field_path("circuit_breaker.success_threshold")
                    .with_source("circuit_breaker"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Three-state circuit breaker.
///
/// - Closed: every call passes; `failure_threshold` failures open the circuit
/// - Open: calls are rejected until `recovery_timeout` has passed since the last failure
/// - Half-open: probes pass; `success_threshold` successes close, any failure re-opens
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Result<Self> {
        Self::named("default", cfg)
    }

    /// Breaker whose log lines carry `name` (usually the protected dependency).
    pub fn named(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            name: name.into(),
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_remaining(&self, st: &State, now: Instant) -> Duration {
        st.last_failure
            .map(|at| match at.checked_add(self.cfg.recovery_timeout) {
                Some(until) => until.saturating_duration_since(now),
                None => Duration::MAX,
            })
            .unwrap_or(Duration::ZERO)
    }

    /// Whether a call may proceed. An open circuit past its recovery timeout
    /// moves to half-open and admits this call as a probe.
    pub fn can_execute(&self) -> bool {
        let mut st = self.lock();
        let current = st.state;
        match current {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.open_remaining(&st, Instant::now()).is_zero() {
                    st.state = CircuitState::HalfOpen;
                    st.success_count = 0;
                    info!(breaker = %self.name, "circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut st = self.lock();
        let current = st.state;
        match current {
            CircuitState::HalfOpen => {
                st.success_count = st.success_count.saturating_add(1);
                if st.success_count >= self.cfg.success_threshold {
                    st.state = CircuitState::Closed;
                    st.failure_count = 0;
                    st.success_count = 0;
                    info!(breaker = %self.name, "circuit closed");
                }
            }
            CircuitState::Closed | CircuitState::Open => {
                st.failure_count = 0;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut st = self.lock();
        let now = Instant::now();
        st.failure_count = st.failure_count.saturating_add(1);
        st.last_failure = Some(now);
        let current = st.state;
        match current {
            CircuitState::HalfOpen => {
                st.state = CircuitState::Open;
                st.success_count = 0;
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            CircuitState::Closed => {
                if st.failure_count >= self.cfg.failure_threshold {
                    st.state = CircuitState::Open;
                    warn!(
                        breaker = %self.name,
                        failures = st.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Time until an open circuit admits a probe; zero unless open.
    pub fn retry_after(&self) -> Duration {
        let st = self.lock();
        if st.state == CircuitState::Open {
            self.open_remaining(&st, Instant::now())
        } else {
            Duration::ZERO
        }
    }

    /// Force the breaker back to closed with cleared counters.
    pub fn reset(&self) {
        let mut st = self.lock();
        st.state = CircuitState::Closed;
        st.failure_count = 0;
        st.success_count = 0;
        st.last_failure = None;
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let st = self.lock();
        let open_remaining_ms = if st.state == CircuitState::Open {
            Some(self.open_remaining(&st, Instant::now()).as_millis() as u64)
        } else {
            None
        };
        CircuitBreakerSnapshot {
            state: st.state,
            failure_threshold: self.cfg.failure_threshold,
            success_threshold: self.cfg.success_threshold,
            recovery_timeout_ms: self.cfg.recovery_timeout.as_millis() as u64,
            failure_count: st.failure_count,
            success_count: st.success_count,
            open_remaining_ms,
        }
    }
}
