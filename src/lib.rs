//! # apiguard
//!
//! Throttling, retry and failure isolation for outbound calls to rate-limited
//! third-party APIs (exchanges, market-data feeds, LLM providers, webhooks).
//!
//! ## Overview
//!
//! Every dependency gets a [`GuardedClient`]: a throttle that decides *when* a
//! request may leave, a [`RetryHandler`] that decides *whether* a failed request
//! is tried again, and an optional circuit breaker that stops calling a
//! dependency that keeps failing. Policies are plain data and can be loaded from
//! YAML or JSON via [`config::ResilienceConfig`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use apiguard::classify::ErrorClass;
//! use apiguard::config::ResilienceConfig;
//!
//! #[tokio::main]
//! async fn main() -> apiguard::Result<()> {
//!     let config = ResilienceConfig::from_file("policy.yaml")?;
//!     let clients = config.build_clients()?;
//!     let binance = &clients["binance"];
//!
//!     let ticker = binance
//!         .call(|| async { Ok::<_, ErrorClass>("BTCUSDT 64000.0") })
//!         .await;
//!     println!("{:?}", ticker);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Sliding-window, token-bucket and adaptive limiters; circuit breaker |
//! | [`retry`] | Retry policy, handler, decorator form and statistics |
//! | [`batch`] | Bulk execution of item batches through a retry handler |
//! | [`classify`] | Error classes and HTTP status / `Retry-After` mapping |
//! | [`client`] | Guarded clients combining throttle, breaker and retry |
//! | [`config`] | Policy documents and environment loading |

pub mod batch;
pub mod classify;
pub mod client;
pub mod config;
pub mod resilience;
pub mod retry;

// Re-export main types for convenience
pub use classify::{Classify, ErrorClass};
pub use client::{ClientSignals, GuardedClient, Throttle};
pub use config::{ClientPolicy, ResilienceConfig};
pub use resilience::adaptive::AdaptiveRateLimiter;
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitState};
pub use resilience::rate_limiter::{RateLimit, RateLimiter};
pub use resilience::token_bucket::TokenBucketRateLimiter;
pub use retry::{RetryConfig, RetryError, RetryHandler, RetryStrategy};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
