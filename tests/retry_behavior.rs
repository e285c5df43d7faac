use apiguard::batch::{BatchConfig, BatchStrategy};
use apiguard::classify::{Classify, ErrorClass};
use apiguard::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use apiguard::retry::{RetryConfig, RetryError, RetryHandler, RetryStrategy};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[derive(Debug)]
enum ExchangeError {
    Timeout,
    InvalidApiKey,
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Timeout => write!(f, "request timed out"),
            ExchangeError::InvalidApiKey => write!(f, "invalid api key"),
        }
    }
}

impl Classify for ExchangeError {
    fn classify(&self) -> ErrorClass {
        match self {
            ExchangeError::Timeout => ErrorClass::Transient,
            ExchangeError::InvalidApiKey => ErrorClass::Permanent,
        }
    }
}

fn no_wait(max_retries: u32) -> RetryConfig {
    RetryConfig::new()
        .with_max_retries(max_retries)
        .with_strategy(RetryStrategy::FixedDelay)
        .with_base_delay(Duration::ZERO)
        .with_jitter(false)
}

#[tokio::test]
async fn test_fails_twice_then_succeeds() {
    let handler = RetryHandler::new(no_wait(2)).unwrap();
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let price = handler
        .execute(move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ExchangeError::Timeout)
            } else {
                Ok(64_250.5)
            }
        })
        .await;
    assert_eq!(assert_ok!(price), 64_250.5);

    let stats = handler.stats();
    assert_eq!(stats.total_retries, 2);
    assert_eq!(stats.total_successes, 1);
    assert_eq!(stats.total_failures, 0);
    assert_eq!(stats.total_attempts, 3);
}

#[tokio::test]
async fn test_exhaustion_returns_original_error() {
    let handler = RetryHandler::new(no_wait(4)).unwrap();
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let err = assert_err!(
        handler
            .execute(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ExchangeError::Timeout)
            })
            .await
    );
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert!(matches!(err, RetryError::Operation(ExchangeError::Timeout)));
    assert_eq!(handler.stats().total_failures, 1);
}

#[test]
fn test_permanent_error_is_not_retried() {
    let handler = RetryHandler::new(no_wait(10)).unwrap();
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = handler.execute_blocking(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(ExchangeError::InvalidApiKey)
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        result,
        Err(RetryError::Operation(ExchangeError::InvalidApiKey))
    ));
}

#[tokio::test]
async fn test_predicate_can_veto_retry() {
    let config = no_wait(5).with_predicate(|ctx| !ctx.message.contains("timed out"));
    let handler = RetryHandler::new(config).unwrap();
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let result = handler
        .execute(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ExchangeError::Timeout)
        })
        .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_cycle_through_handler() {
    let breaker = CircuitBreaker::named(
        "kraken",
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_recovery_timeout(Duration::from_secs(5))
            .with_success_threshold(2),
    )
    .unwrap();
    let handler = RetryHandler::named("kraken", no_wait(0))
        .unwrap()
        .with_circuit_breaker(breaker);

    for _ in 0..3 {
        let _ = handler
            .execute(|| async { Err::<(), _>(ExchangeError::Timeout) })
            .await;
    }
    assert_eq!(handler.stats().circuit_state, Some(CircuitState::Open));

    let calls = AtomicU32::new(0);
    let counter = &calls;
    let rejected = handler
        .execute(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ExchangeError>(())
        })
        .await;
    assert!(rejected.as_ref().is_err_and(|e| e.is_circuit_open()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let message = rejected.unwrap_err().to_string();
    assert!(message.starts_with("service unavailable: circuit 'kraken' is open"));

    tokio::time::advance(Duration::from_secs(5)).await;
    for _ in 0..2 {
        assert_ok!(handler.execute(|| async { Ok::<_, ExchangeError>(()) }).await);
    }
    let breaker = handler.circuit_breaker().unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.snapshot().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exponential_schedule_is_slept() {
    let handler = RetryHandler::new(
        RetryConfig::new()
            .with_max_retries(3)
            .with_base_delay(Duration::from_secs(1))
            .with_strategy(RetryStrategy::ExponentialBackoff)
            .with_jitter(false),
    )
    .unwrap();
    let start = tokio::time::Instant::now();
    let _ = handler
        .execute(|| async { Err::<(), _>(ExchangeError::Timeout) })
        .await;
    // 1 + 2 + 4
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_millis(7_100));
}

#[tokio::test]
async fn test_decorated_fetch() {
    let fetch = RetryHandler::new(no_wait(1))
        .unwrap()
        .wrap(|symbol: &'static str| async move {
            if symbol == "BTCUSDT" {
                Ok(symbol.len())
            } else {
                Err(ExchangeError::InvalidApiKey)
            }
        });
    assert_eq!(fetch.call("BTCUSDT").await.unwrap(), 7);
    assert!(fetch.call("???").await.is_err());
    assert_eq!(fetch.handler().stats().total_successes, 1);
}

#[tokio::test]
async fn test_bulk_symbol_refresh() {
    let handler = RetryHandler::new(no_wait(2)).unwrap();
    let symbols: Vec<String> = ["BTC", "ETH", "SOL", "XRP", "BAD", "ADA", "DOT"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let config = BatchConfig::new()
        .with_batch_size(2)
        .with_strategy(BatchStrategy::Concurrent { max_concurrency: 2 });

    let result = handler
        .execute_bulk(symbols, &config, |batch: Vec<String>| async move {
            if batch.iter().any(|s| s == "BAD") {
                Err(ExchangeError::InvalidApiKey)
            } else {
                Ok(batch.into_iter().map(|s| format!("{s}USDT")).collect::<Vec<_>>())
            }
        })
        .await
        .unwrap();

    assert_eq!(result.total_batches, 4);
    assert_eq!(result.successes, vec!["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT", "DOTUSDT"]);
    let failed: Vec<&String> = result.failed_items().map(|(s, _)| s).collect();
    assert_eq!(failed, vec!["BAD", "ADA"]);
}
