//! # Resilience Primitives Module
//!
//! Throttling and failure isolation for outbound calls to rate-limited,
//! occasionally failing dependencies.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Multi-window sliding-log limiter (e.g. N/minute AND M/hour) |
//! | [`token_bucket`] | Continuous-refill token bucket for burst-then-drain throughput |
//! | [`adaptive`] | Sliding-window limiter with a feedback-tuned backoff multiplier |
//! | [`circuit_breaker`] | Closed / open / half-open breaker for failure isolation |
//!
//! All shared state sits behind `std::sync::Mutex`, so every component is usable
//! from async tasks and from plain threads. Waiting always happens outside the lock.
//!
//! ## Rate Limiter
//!
//! ```rust
//! use apiguard::resilience::rate_limiter::RateLimiterConfig;
//!
//! let limiter = RateLimiterConfig::new()
//!     .with_requests_per_minute(1200)
//!     .with_requests_per_second(20)
//!     .build()
//!     .unwrap();
//!
//! if limiter.try_acquire() {
//!     // Proceed with request...
//! }
//! ```
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use apiguard::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::new()
//!     .with_failure_threshold(5)
//!     .with_recovery_timeout(Duration::from_secs(30));
//! let breaker = CircuitBreaker::named("binance", config).unwrap();
//!
//! if breaker.can_execute() {
//!     // Make API call...
//!     breaker.record_success();
//! }
//! ```

pub mod adaptive;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod token_bucket;
