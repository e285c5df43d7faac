//! Guarded clients: one throttle plus one retry handler per dependency.
//!
//! A [`GuardedClient`] is what call sites hold on to. Every attempt first passes
//! the circuit breaker (inside the retry handler), then waits on the throttle,
//! then runs the operation. Outcomes flow back into adaptive throttles so the
//! request spacing follows what the dependency reports.

use crate::classify::Classify;
use crate::config::ClientPolicy;
use crate::resilience::adaptive::{AdaptiveRateLimiter, AdaptiveSnapshot};
use crate::resilience::circuit_breaker::CircuitBreakerSnapshot;
use crate::resilience::rate_limiter::{RateLimiter, RateLimiterStats};
use crate::resilience::token_bucket::{TokenBucketRateLimiter, TokenBucketSnapshot};
use crate::retry::{RetryError, RetryHandler, RetryStats};
use serde::Serialize;
use std::fmt;
use std::future::Future;

/// Admission control in front of a dependency.
#[derive(Debug)]
pub enum Throttle {
    Unlimited,
    Window(RateLimiter),
    Bucket(TokenBucketRateLimiter),
    Adaptive(AdaptiveRateLimiter),
}

impl Throttle {
    /// Wait until one request may be sent.
    pub async fn acquire(&self) {
        match self {
            Throttle::Unlimited => {}
            Throttle::Window(limiter) => limiter.acquire().await,
            Throttle::Bucket(bucket) => {
                // positive and within capacity, so never refused
                let cost = bucket.config().capacity.min(1.0);
                let admitted = bucket.acquire(cost).await;
                debug_assert!(admitted.is_ok(), "bucket refused cost {}", cost);
            }
            Throttle::Adaptive(limiter) => limiter.acquire().await,
        }
    }

    /// Feed an attempt's outcome back. Only adaptive throttles react.
    pub fn report<T, E: Classify>(&self, outcome: &Result<T, E>) {
        let Throttle::Adaptive(limiter) = self else {
            return;
        };
        match outcome {
            Ok(_) => limiter.report_success(),
            Err(err) => {
                limiter.report_error(err.classify());
                if let Some(after) = err.retry_after() {
                    limiter.report_retry_after(after);
                }
            }
        }
    }

    pub fn snapshot(&self) -> ThrottleSnapshot {
        match self {
            Throttle::Unlimited => ThrottleSnapshot::Unlimited,
            Throttle::Window(limiter) => ThrottleSnapshot::Window(limiter.stats()),
            Throttle::Bucket(bucket) => ThrottleSnapshot::Bucket(bucket.snapshot()),
            Throttle::Adaptive(limiter) => ThrottleSnapshot::Adaptive {
                windows: limiter.inner().stats(),
                adaptive: limiter.snapshot(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThrottleSnapshot {
    Unlimited,
    Window(RateLimiterStats),
    Bucket(TokenBucketSnapshot),
    Adaptive {
        windows: RateLimiterStats,
        adaptive: AdaptiveSnapshot,
    },
}

/// Runtime facts about one client, for dashboards and health checks.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSignals {
    pub name: String,
    pub throttle: ThrottleSnapshot,
    pub circuit_breaker: Option<CircuitBreakerSnapshot>,
    pub retry: RetryStats,
}

#[derive(Debug)]
pub struct GuardedClient {
    name: String,
    throttle: Throttle,
    retry: RetryHandler,
}

impl GuardedClient {
    pub fn new(name: impl Into<String>, throttle: Throttle, retry: RetryHandler) -> Self {
        Self {
            name: name.into(),
            throttle,
            retry,
        }
    }

    pub fn from_policy(name: &str, policy: &ClientPolicy) -> crate::Result<Self> {
        Ok(Self::new(
            name,
            policy.build_throttle()?,
            policy.build_retry_handler(name)?,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn retry_handler(&self) -> &RetryHandler {
        &self.retry
    }

    /// Run `operation` with throttling on every attempt and retries around it.
    pub async fn call<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let throttle = &self.throttle;
        self.retry
            .execute(move || {
                let attempt = operation();
                async move {
                    throttle.acquire().await;
                    let outcome = attempt.await;
                    throttle.report(&outcome);
                    outcome
                }
            })
            .await
    }

    pub fn signals(&self) -> ClientSignals {
        ClientSignals {
            name: self.name.clone(),
            throttle: self.throttle.snapshot(),
            circuit_breaker: self.retry.circuit_breaker().map(|b| b.snapshot()),
            retry: self.retry.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorClass;
    use crate::resilience::adaptive::AdaptiveConfig;
    use crate::resilience::token_bucket::TokenBucketConfig;
    use crate::retry::{RetryConfig, RetryStrategy};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn quick_retry() -> RetryHandler {
        RetryHandler::named(
            "test",
            RetryConfig::new()
                .with_max_retries(3)
                .with_strategy(RetryStrategy::FixedDelay)
                .with_base_delay(Duration::from_millis(10))
                .with_jitter(false),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_takes_a_slot() {
        let client = GuardedClient::new(
            "coingecko",
            Throttle::Window(RateLimiter::per_minute(10).unwrap()),
            quick_retry(),
        );
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let value = client
            .call(move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ErrorClass::Transient)
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        let Throttle::Window(limiter) = client.throttle() else {
            panic!("expected window throttle");
        };
        assert_eq!(limiter.stats().total_requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_throttle_receives_feedback() {
        let inner = RateLimiter::per_minute(600).unwrap();
        let client = GuardedClient::new(
            "binance",
            Throttle::Adaptive(AdaptiveRateLimiter::new(inner, AdaptiveConfig::default()).unwrap()),
            quick_retry(),
        );
        let calls = AtomicU32::new(0);
        let counter = &calls;
        client
            .call(move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ErrorClass::RateLimited)
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        let Throttle::Adaptive(limiter) = client.throttle() else {
            panic!("expected adaptive throttle");
        };
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.total_errors, 1);
        assert_eq!(snapshot.total_successes, 1);
        // 2.0 after the 429, then one recovery step
        assert!((limiter.multiplier() - 2.0 / 1.1).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_throttle_with_fractional_capacity() {
        let bucket = TokenBucketRateLimiter::new(TokenBucketConfig::new(100.0, 0.5)).unwrap();
        let client = GuardedClient::new("openai", Throttle::Bucket(bucket), quick_retry());
        let out: Result<u8, RetryError<ErrorClass>> = client.call(|| async { Ok(1) }).await;
        assert_eq!(out.unwrap(), 1);
        let Throttle::Bucket(bucket) = client.throttle() else {
            panic!("expected bucket throttle");
        };
        // the attempt paid for itself instead of slipping through
        assert!(bucket.available_tokens() < 0.5);
    }

    #[tokio::test]
    async fn test_signals_serialize() {
        let client = GuardedClient::new("airtable", Throttle::Unlimited, quick_retry());
        let _: Result<(), RetryError<ErrorClass>> = client.call(|| async { Ok(()) }).await;
        let signals = client.signals();
        assert_eq!(signals.retry.total_successes, 1);
        let json = serde_json::to_value(&signals).unwrap();
        assert_eq!(json["name"], "airtable");
        assert_eq!(json["throttle"]["kind"], "unlimited");
        assert!(json["circuit_breaker"].is_null());
    }
}
