//! Retry policy: when to retry and how long to wait.

use crate::classify::ErrorClass;
use crate::config::serde_secs;
use crate::{Error, ErrorContext, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `base`
    FixedDelay,
    /// `base * attempt`
    LinearBackoff,
    /// `base * multiplier^(attempt - 1)`
    ExponentialBackoff,
    /// Exponential, scaled by a random factor in `[0.5, 1.5)`.
    JitteredBackoff,
}

/// Facts handed to a custom retry predicate.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub class: ErrorClass,
    pub message: String,
}

/// Final say on whether a classified, still-retryable failure is retried.
pub type RetryPredicate = Arc<dyn Fn(&RetryContext) -> bool + Send + Sync>;

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "serde_secs")]
    pub base_delay: Duration,
    #[serde(with = "serde_secs")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub strategy: RetryStrategy,
    /// Extra `[0.8, 1.2)` spread for every strategy except `JitteredBackoff`.
    pub jitter: bool,
    pub retryable: Vec<ErrorClass>,
    pub non_retryable: Vec<ErrorClass>,
    #[serde(skip)]
    pub predicate: Option<RetryPredicate>,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("strategy", &self.strategy)
            .field("jitter", &self.jitter)
            .field("retryable", &self.retryable)
            .field("non_retryable", &self.non_retryable)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            strategy: RetryStrategy::ExponentialBackoff,
            jitter: true,
            retryable: vec![ErrorClass::Transient, ErrorClass::RateLimited],
            non_retryable: vec![ErrorClass::Permanent],
            predicate: None,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_retryable(mut self, classes: Vec<ErrorClass>) -> Self {
        self.retryable = classes;
        self
    }

    pub fn with_non_retryable(mut self, classes: Vec<ErrorClass>) -> Self {
        self.non_retryable = classes;
        self
    }

    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&RetryContext) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_delay < self.base_delay {
            return Err(Error::validation_with_context(
                "max_delay must not be smaller than base_delay",
                ErrorContext::new()
                    .with_field_path("retry.max_delay")
                    .with_details(format!(
                        "base_delay {:?}, max_delay {:?}",
                        self.base_delay, self.max_delay
                    ))
                    .with_source("retry_handler"),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::validation_with_context(
                "backoff_multiplier must be finite and at least 1.0",
                ErrorContext::new()
                    .with_field_path("retry.backoff_multiplier")
                    .with_details(format!("got {}", self.backoff_multiplier))
                    .with_source("retry_handler"),
            ));
        }
        Ok(())
    }

    /// Delay in seconds for `attempt` before jitter and capping.
    pub fn raw_delay_secs(&self, attempt: u32) -> f64 {
        let attempt = attempt.max(1);
        let base = self.base_delay.as_secs_f64();
        match self.strategy {
            RetryStrategy::FixedDelay => base,
            RetryStrategy::LinearBackoff => base * attempt as f64,
            RetryStrategy::ExponentialBackoff | RetryStrategy::JitteredBackoff => {
                let exp = (attempt - 1).min(i32::MAX as u32) as i32;
                base * self.backoff_multiplier.powi(exp)
            }
        }
    }

    /// Delay to sleep after failed `attempt` (1-based), jittered and capped at `max_delay`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let mut secs = self.raw_delay_secs(attempt);
        let mut rng = rand::thread_rng();
        if self.strategy == RetryStrategy::JitteredBackoff {
            secs *= rng.gen_range(0.5..1.5);
        } else if self.jitter {
            secs *= rng.gen_range(0.8..1.2);
        }
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Classification filter, applied in order: non-retryable list, attempt budget,
    /// retryable list, then the predicate if one is configured.
    pub fn should_retry(&self, class: ErrorClass, attempt: u32, message: impl FnOnce() -> String) -> bool {
        if self.non_retryable.contains(&class) {
            return false;
        }
        if attempt > self.max_retries {
            return false;
        }
        if !self.retryable.contains(&class) {
            return false;
        }
        match &self.predicate {
            Some(predicate) => predicate(&RetryContext {
                attempt,
                class,
                message: message(),
            }),
            None => true,
        }
    }
}
