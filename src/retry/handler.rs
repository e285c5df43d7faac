use crate::batch::{BatchConfig, BatchExecutor, BatchResult};
use crate::classify::{Classify, ErrorClass};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitState};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::policy::RetryConfig;

/// Outcome of a call that did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The circuit breaker rejected the call; the operation was not invoked.
    CircuitOpen { name: String, retry_after: Duration },
    /// The operation's own error from the last attempt, unchanged.
    Operation(E),
}

impl<E> RetryError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RetryError::CircuitOpen { .. })
    }

    pub fn operation(&self) -> Option<&E> {
        match self {
            RetryError::Operation(e) => Some(e),
            RetryError::CircuitOpen { .. } => None,
        }
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            RetryError::Operation(e) => Some(e),
            RetryError::CircuitOpen { .. } => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::CircuitOpen { name, retry_after } => write!(
                f,
                "service unavailable: circuit '{}' is open (retry in {} ms)",
                name,
                retry_after.as_millis()
            ),
            RetryError::Operation(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Operation(e) => e.source(),
            RetryError::CircuitOpen { .. } => None,
        }
    }
}

impl<E: Classify> Classify for RetryError<E> {
    fn classify(&self) -> ErrorClass {
        match self {
            RetryError::CircuitOpen { .. } => ErrorClass::Transient,
            RetryError::Operation(e) => e.classify(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            RetryError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            RetryError::Operation(e) => e.retry_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryStats {
    pub total_attempts: u64,
    pub total_retries: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Successful calls over finished calls.
    pub success_rate: f64,
    /// Retries over attempts.
    pub retry_rate: f64,
    pub circuit_state: Option<CircuitState>,
}

#[derive(Debug, Default)]
struct Counters {
    attempts: u64,
    retries: u64,
    successes: u64,
    failures: u64,
}

/// Runs operations under a [`RetryConfig`], optionally behind a [`CircuitBreaker`].
///
/// Two entry points exist: [`execute`](Self::execute) for async operations and
/// [`execute_blocking`](Self::execute_blocking) for plain functions called from
/// ordinary threads.
pub struct RetryHandler {
    name: String,
    config: RetryConfig,
    breaker: Option<CircuitBreaker>,
    counters: Mutex<Counters>,
}

impl fmt::Debug for RetryHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHandler")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> crate::Result<Self> {
        Self::named("default", config)
    }

    pub fn named(name: impl Into<String>, config: RetryConfig) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            breaker: None,
            counters: Mutex::new(Counters::default()),
        })
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Delay that would follow failed `attempt` (jitter included).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.config.calculate_delay(attempt)
    }

    /// Unjittered delay after failed `attempt`, capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let secs = self.config.raw_delay_secs(attempt);
        if !secs.is_finite() || secs >= self.config.max_delay.as_secs_f64() {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_circuit<E>(&self) -> Result<(), RetryError<E>> {
        let Some(breaker) = &self.breaker else {
            return Ok(());
        };
        if breaker.can_execute() {
            return Ok(());
        }
        let retry_after = breaker.retry_after();
        self.counters().failures += 1;
        warn!(
            client = %self.name,
            retry_after_ms = retry_after.as_millis() as u64,
            "circuit open, call rejected"
        );
        Err(RetryError::CircuitOpen {
            name: breaker.name().to_string(),
            retry_after,
        })
    }

    fn begin_attempt(&self) {
        self.counters().attempts += 1;
    }

    fn on_success(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.record_success();
        }
        self.counters().successes += 1;
    }

    /// Record a failed attempt and decide whether to go again.
    ///
    /// Returns the delay before the next attempt, or `None` to give up.
    fn on_failure<E>(&self, err: &E, attempt: u32) -> Option<Duration>
    where
        E: Classify + fmt::Display,
    {
        if let Some(breaker) = &self.breaker {
            breaker.record_failure();
        }
        let class = err.classify();
        if !self.config.should_retry(class, attempt, || err.to_string()) {
            self.counters().failures += 1;
            let exhausted = attempt > self.config.max_retries
                && self.config.retryable.contains(&class)
                && !self.config.non_retryable.contains(&class);
            if exhausted {
                error!(client = %self.name, attempts = attempt, %class, error = %err, "retries exhausted");
            } else {
                debug!(client = %self.name, attempt, %class, error = %err, "not retrying");
            }
            return None;
        }

        let mut delay = self.config.calculate_delay(attempt);
        if let Some(hint) = err.retry_after() {
            delay = delay.max(hint).min(self.config.max_delay);
        }
        self.counters().retries += 1;
        warn!(
            client = %self.name,
            attempt,
            %class,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "attempt failed, retrying"
        );
        Some(delay)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// runs out of retries. The last operation error is returned unchanged.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            self.check_circuit::<E>()?;
            attempt += 1;
            self.begin_attempt();
            match operation().await {
                Ok(value) => {
                    self.on_success();
                    return Ok(value);
                }
                Err(err) => match self.on_failure(&err, attempt) {
                    Some(delay) => {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    None => return Err(RetryError::Operation(err)),
                },
            }
        }
    }

    /// Thread-blocking variant of [`execute`](Self::execute) for synchronous operations.
    pub fn execute_blocking<T, E, F>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: Classify + fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            self.check_circuit::<E>()?;
            attempt += 1;
            self.begin_attempt();
            match operation() {
                Ok(value) => {
                    self.on_success();
                    return Ok(value);
                }
                Err(err) => match self.on_failure(&err, attempt) {
                    Some(delay) => {
                        if !delay.is_zero() {
                            std::thread::sleep(delay);
                        }
                    }
                    None => return Err(RetryError::Operation(err)),
                },
            }
        }
    }

    /// Split `items` into batches and run each batch through [`execute`](Self::execute).
    pub async fn execute_bulk<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        config: &BatchConfig,
        operation: F,
    ) -> crate::Result<BatchResult<T, R, E>>
    where
        T: Clone,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<Vec<R>, E>>,
        E: Classify + fmt::Display,
    {
        BatchExecutor::with_config(config.clone())
            .execute(self, items, operation)
            .await
    }

    /// Bind `f` to this handler so every call is retried transparently.
    pub fn wrap<F>(self, f: F) -> RetryingFn<F> {
        RetryingFn { handler: self, f }
    }

    pub fn stats(&self) -> RetryStats {
        let c = self.counters();
        let finished = c.successes + c.failures;
        RetryStats {
            total_attempts: c.attempts,
            total_retries: c.retries,
            total_successes: c.successes,
            total_failures: c.failures,
            success_rate: if finished == 0 {
                0.0
            } else {
                c.successes as f64 / finished as f64
            },
            retry_rate: if c.attempts == 0 {
                0.0
            } else {
                c.retries as f64 / c.attempts as f64
            },
            circuit_state: self.breaker.as_ref().map(|b| b.state()),
        }
    }

    pub fn reset_stats(&self) {
        *self.counters() = Counters::default();
    }
}

/// A function bound to its own [`RetryHandler`].
///
/// Use [`call`](Self::call) when `F` returns a future and
/// [`call_blocking`](Self::call_blocking) when it returns a `Result` directly.
pub struct RetryingFn<F> {
    handler: RetryHandler,
    f: F,
}

impl<F> RetryingFn<F> {
    pub fn handler(&self) -> &RetryHandler {
        &self.handler
    }

    pub async fn call<A, T, E, Fut>(&self, arg: A) -> Result<T, RetryError<E>>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        A: Clone,
        E: Classify + fmt::Display,
    {
        self.handler.execute(|| (self.f)(arg.clone())).await
    }

    pub fn call_blocking<A, T, E>(&self, arg: A) -> Result<T, RetryError<E>>
    where
        F: Fn(A) -> Result<T, E>,
        A: Clone,
        E: Classify + fmt::Display,
    {
        self.handler.execute_blocking(|| (self.f)(arg.clone()))
    }
}
