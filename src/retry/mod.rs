//! # Retry Module
//!
//! Retries classified failures with a configurable delay schedule, optionally
//! behind a [`CircuitBreaker`](crate::resilience::circuit_breaker::CircuitBreaker).
//!
//! ## Decision order
//!
//! After a failed attempt the handler stops when, in order:
//! 1. the error class is listed as non-retryable
//! 2. the attempt number exceeds `max_retries`
//! 3. the error class is not listed as retryable
//! 4. a configured predicate returns `false`
//!
//! Otherwise it sleeps for the strategy's delay (capped at `max_delay`, and never
//! shorter than a server-provided `retry_after`) and tries again.
//!
//! ```rust
//! use apiguard::classify::ErrorClass;
//! use apiguard::retry::{RetryConfig, RetryHandler, RetryStrategy};
//! use std::time::Duration;
//!
//! # async fn run() -> apiguard::Result<()> {
//! let handler = RetryHandler::new(
//!     RetryConfig::new()
//!         .with_max_retries(2)
//!         .with_strategy(RetryStrategy::FixedDelay)
//!         .with_base_delay(Duration::from_millis(10)),
//! )?;
//!
//! let price = handler
//!     .execute(|| async { Ok::<_, ErrorClass>(64_000u64) })
//!     .await;
//! assert!(price.is_ok());
//! # Ok(())
//! # }
//! ```

mod handler;
mod policy;

pub use handler::{RetryError, RetryHandler, RetryStats, RetryingFn};
pub use policy::{RetryConfig, RetryContext, RetryPredicate, RetryStrategy};
