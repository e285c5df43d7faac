use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::rate_limiter::recheck_delay;

#[derive(Debug, Clone, Serialize)]
pub struct TokenBucketSnapshot {
    pub rate: f64,
    pub capacity: f64,
    pub tokens: f64,
    /// Estimated wait time until one token is available (ms), if currently short.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Tokens added per second.
    pub rate: f64,
    /// Maximum number of stored tokens (burst size).
    pub capacity: f64,
}

impl TokenBucketConfig {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self { rate, capacity }
    }

    /// One second worth of burst, at least one token.
    pub fn from_rate(rate: f64) -> Self {
        Self {
            rate,
            capacity: rate.max(1.0),
        }
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(Error::validation_with_context(
                "token bucket rate must be positive",
                ErrorContext::new()
                    .with_field_path("token_bucket.rate")
                    .with_details(format!("got {}", self.rate))
                    .with_source("token_bucket"),
            ));
        }
        if !self.capacity.is_finite() || self.capacity <= 0.0 {
            return Err(Error::validation_with_context(
                "token bucket capacity must be positive",
                ErrorContext::new()
                    .with_field_path("token_bucket.capacity")
                    .with_details(format!("got {}", self.capacity))
                    .with_source("token_bucket"),
            ));
        }
        Ok(())
    }

    pub fn build(&self) -> Result<TokenBucketRateLimiter> {
        TokenBucketRateLimiter::new(self.clone())
    }
}

#[derive(Debug)]
struct State {
    tokens: f64,
    last: Instant,
}

/// Continuous-refill token bucket.
///
/// Starts full. Refill and debit happen under one lock, so concurrent callers
/// can never jointly overdraw the bucket.
#[derive(Debug)]
pub struct TokenBucketRateLimiter {
    cfg: TokenBucketConfig,
    state: Mutex<State>,
}

impl TokenBucketRateLimiter {
    pub fn new(cfg: TokenBucketConfig) -> Result<Self> {
        cfg.validate()?;
        let state = Mutex::new(State {
            tokens: cfg.capacity,
            last: Instant::now(),
        });
        Ok(Self { cfg, state })
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn refill_locked(cfg: &TokenBucketConfig, st: &mut State) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(st.last).as_secs_f64();
        if elapsed > 0.0 {
            st.tokens = (st.tokens + elapsed * cfg.rate).min(cfg.capacity);
            st.last = now;
        }
    }

    fn check_request(&self, tokens: f64) -> Result<()> {
        if !tokens.is_finite() || tokens <= 0.0 || tokens > self.cfg.capacity {
            return Err(Error::validation_with_context(
                "requested tokens must be positive and within capacity",
                ErrorContext::new()
                    .with_details(format!("requested {}, capacity {}", tokens, self.cfg.capacity))
                    .with_source("token_bucket"),
            ));
        }
        Ok(())
    }

    /// Debit `tokens` if available. On shortfall returns the missing amount.
    fn try_take(&self, tokens: f64) -> std::result::Result<(), f64> {
        let mut st = self.lock();
        Self::refill_locked(&self.cfg, &mut st);
        if st.tokens >= tokens {
            st.tokens -= tokens;
            Ok(())
        } else {
            Err(tokens - st.tokens)
        }
    }

    /// Debit `tokens` if available, otherwise report how long until they will be.
    fn take_or_wait(&self, tokens: f64) -> Option<Duration> {
        let missing = self.try_take(tokens).err()?;
        Some(Duration::try_from_secs_f64(missing / self.cfg.rate).unwrap_or(Duration::MAX))
    }

    /// Acquire `tokens` units (may sleep).
    pub async fn acquire(&self, tokens: f64) -> Result<()> {
        self.check_request(tokens)?;
        while let Some(wait) = self.take_or_wait(tokens) {
            debug!(wait_ms = wait.as_millis() as u64, tokens, "token bucket empty, waiting");
            tokio::time::sleep(recheck_delay(wait)).await;
        }
        Ok(())
    }

    /// Thread-blocking variant of [`acquire`](Self::acquire).
    pub fn acquire_blocking(&self, tokens: f64) -> Result<()> {
        self.check_request(tokens)?;
        while let Some(wait) = self.take_or_wait(tokens) {
            debug!(wait_ms = wait.as_millis() as u64, tokens, "token bucket empty, blocking");
            std::thread::sleep(recheck_delay(wait));
        }
        Ok(())
    }

    /// Try to take `tokens` without waiting, returns true if successful.
    pub fn try_acquire(&self, tokens: f64) -> bool {
        if self.check_request(tokens).is_err() {
            return false;
        }
        self.try_take(tokens).is_ok()
    }

    /// Refill, then report the current balance.
    pub fn available_tokens(&self) -> f64 {
        let mut st = self.lock();
        Self::refill_locked(&self.cfg, &mut st);
        st.tokens
    }

    pub fn snapshot(&self) -> TokenBucketSnapshot {
        let tokens = self.available_tokens();
        let estimated_wait_ms = if tokens < 1.0 {
            Some(((1.0 - tokens) / self.cfg.rate * 1000.0).ceil() as u64)
        } else {
            None
        };
        TokenBucketSnapshot {
            rate: self.cfg.rate,
            capacity: self.cfg.capacity,
            tokens,
            estimated_wait_ms,
        }
    }
}
