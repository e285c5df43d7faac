//! Feedback-driven throttling on top of the sliding-window limiter.
//!
//! Callers report what the dependency told them (success, 429, 5xx, `Retry-After`)
//! and the limiter stretches the spacing between requests accordingly.

use crate::classify::ErrorClass;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::rate_limiter::RateLimiter;

/// Longest block a single `Retry-After` report can impose.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Upper bound for the backoff multiplier.
    pub max_multiplier: f64,
    /// Growth applied on a rate-limited response.
    pub rate_limit_factor: f64,
    /// Growth applied on a transient failure.
    pub error_factor: f64,
    /// Divisor applied on every success.
    pub recovery_factor: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            max_multiplier: 10.0,
            rate_limit_factor: 2.0,
            error_factor: 1.5,
            recovery_factor: 1.1,
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("adaptive.max_multiplier", self.max_multiplier),
            ("adaptive.rate_limit_factor", self.rate_limit_factor),
            ("adaptive.error_factor", self.error_factor),
            ("adaptive.recovery_factor", self.recovery_factor),
        ];
        for (field, value) in checks {
            if !value.is_finite() || value < 1.0 {
                return Err(Error::validation_with_context(
                    "adaptive factors must be finite and at least 1.0",
                    ErrorContext::new()
                        .with_field_path(field)
                        .with_details(format!("got {}", value))
                        .with_source("adaptive_rate_limiter"),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdaptiveSnapshot {
    pub multiplier: f64,
    pub blocked_remaining_ms: Option<u64>,
    pub total_errors: u64,
    pub total_successes: u64,
    pub consecutive_errors: u32,
}

#[derive(Debug)]
struct State {
    multiplier: f64,
    /// Set from a server `Retry-After`; nothing is admitted before it.
    blocked_until: Option<Instant>,
    total_errors: u64,
    total_successes: u64,
    consecutive_errors: u32,
}

/// Sliding-window limiter with a manually tuned backoff multiplier.
///
/// Each admitted request is followed by an extra pause of
/// `base_interval * (multiplier - 1)`, where `base_interval` is the even
/// spacing required by the most restrictive configured window.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    inner: RateLimiter,
    cfg: AdaptiveConfig,
    base_interval: Duration,
    state: Mutex<State>,
}

impl AdaptiveRateLimiter {
    pub fn new(inner: RateLimiter, cfg: AdaptiveConfig) -> Result<Self> {
        cfg.validate()?;
        let base_interval = inner
            .limits()
            .iter()
            .map(|l| l.interval())
            .max()
            .unwrap_or(Duration::ZERO);
        Ok(Self {
            inner,
            cfg,
            base_interval,
            state: Mutex::new(State {
                multiplier: 1.0,
                blocked_until: None,
                total_errors: 0,
                total_successes: 0,
                consecutive_errors: 0,
            }),
        })
    }

    pub fn inner(&self) -> &RateLimiter {
        &self.inner
    }

    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn blocked_remaining(&self) -> Option<Duration> {
        let mut st = self.lock();
        let until = st.blocked_until?;
        let now = Instant::now();
        if until > now {
            Some(until - now)
        } else {
            st.blocked_until = None;
            None
        }
    }

    fn penalty(&self) -> Duration {
        let multiplier = self.lock().multiplier;
        if multiplier > 1.0 {
            self.base_interval.mul_f64(multiplier - 1.0)
        } else {
            Duration::ZERO
        }
    }

    /// Honour any server-imposed block, take a window slot, then pause for the
    /// current backoff penalty.
    pub async fn acquire(&self) {
        while let Some(wait) = self.blocked_remaining() {
            debug!(wait_ms = wait.as_millis() as u64, "blocked by retry-after");
            tokio::time::sleep(wait).await;
        }
        self.inner.acquire().await;
        let penalty = self.penalty();
        if !penalty.is_zero() {
            debug!(penalty_ms = penalty.as_millis() as u64, "adaptive backoff");
            tokio::time::sleep(penalty).await;
        }
    }

    /// Non-blocking admission. The backoff penalty cannot be applied without
    /// waiting, so only the block and the windows are checked.
    pub fn try_acquire(&self) -> bool {
        if self.blocked_remaining().is_some() {
            return false;
        }
        self.inner.try_acquire()
    }

    pub fn report_success(&self) {
        let mut st = self.lock();
        st.total_successes += 1;
        st.consecutive_errors = 0;
        st.multiplier = (st.multiplier / self.cfg.recovery_factor).max(1.0);
    }

    pub fn report_error(&self, class: ErrorClass) {
        let mut st = self.lock();
        st.total_errors += 1;
        st.consecutive_errors = st.consecutive_errors.saturating_add(1);
        let factor = match class {
            ErrorClass::RateLimited => self.cfg.rate_limit_factor,
            ErrorClass::Transient => self.cfg.error_factor,
            ErrorClass::Permanent => 1.0,
        };
        st.multiplier = (st.multiplier * factor).min(self.cfg.max_multiplier);
        if class == ErrorClass::RateLimited {
            warn!(multiplier = st.multiplier, "dependency rate limited, slowing down");
        }
    }

    /// Block all acquisitions for `after` (at most [`MAX_RETRY_AFTER`]),
    /// extending any existing block.
    pub fn report_retry_after(&self, after: Duration) {
        let mut st = self.lock();
        let until = Instant::now() + after.min(MAX_RETRY_AFTER);
        let until = match st.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        };
        st.blocked_until = Some(until);
    }

    pub fn multiplier(&self) -> f64 {
        self.lock().multiplier
    }

    pub fn snapshot(&self) -> AdaptiveSnapshot {
        let st = self.lock();
        let now = Instant::now();
        AdaptiveSnapshot {
            multiplier: st.multiplier,
            blocked_remaining_ms: st
                .blocked_until
                .filter(|until| *until > now)
                .map(|until| (until - now).as_millis() as u64),
            total_errors: st.total_errors,
            total_successes: st.total_successes,
            consecutive_errors: st.consecutive_errors,
        }
    }

    pub fn reset(&self) {
        self.inner.reset();
        let mut st = self.lock();
        st.multiplier = 1.0;
        st.blocked_until = None;
        st.total_errors = 0;
        st.total_successes = 0;
        st.consecutive_errors = 0;
    }
}
