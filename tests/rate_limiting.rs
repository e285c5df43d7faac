use apiguard::classify::ErrorClass;
use apiguard::resilience::adaptive::{AdaptiveConfig, AdaptiveRateLimiter};
use apiguard::resilience::rate_limiter::{RateLimit, RateLimiter, RateLimiterConfig};
use apiguard::resilience::token_bucket::{TokenBucketConfig, TokenBucketRateLimiter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_third_request_waits_for_the_first_to_expire() {
    let limiter = RateLimiter::per_minute(2).unwrap();
    let t1 = Instant::now();
    limiter.acquire().await;
    tokio::time::advance(Duration::from_secs(10)).await;
    limiter.acquire().await;

    limiter.acquire().await;
    let waited = t1.elapsed();
    assert!(waited >= Duration::from_secs(60), "admitted after {:?}", waited);
    assert!(waited < Duration::from_secs(61));

    let stats = limiter.stats();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.total_waits, 1);
    assert!(stats.total_wait_time_secs >= 49.9);
}

#[tokio::test(start_paused = true)]
async fn test_every_window_is_enforced() {
    // Binance-style: 5/s and 12/min
    let limiter = RateLimiterConfig::new()
        .with_requests_per_second(5)
        .with_requests_per_minute(12)
        .build()
        .unwrap();

    let mut admitted = 0;
    for _ in 0..30 {
        if limiter.try_acquire() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);

    tokio::time::advance(Duration::from_secs(1)).await;
    for _ in 0..30 {
        if limiter.try_acquire() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);

    tokio::time::advance(Duration::from_secs(1)).await;
    for _ in 0..30 {
        if limiter.try_acquire() {
            admitted += 1;
        }
    }
    // minute window caps the third second at two more
    assert_eq!(admitted, 12);
    let wait = limiter.time_until_available();
    assert!(wait > Duration::from_secs(57) && wait <= Duration::from_secs(58));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_tasks_never_exceed_quota() {
    let limiter = Arc::new(RateLimiter::new(vec![RateLimit::per_second(4).unwrap()]).unwrap());
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..12 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            limiter.acquire().await;
            Instant::now()
        }));
    }
    let mut admitted_at = Vec::new();
    for handle in handles {
        admitted_at.push(handle.await.unwrap() - start);
    }
    admitted_at.sort();
    // any 1s span holds at most 4 admissions
    for pair in admitted_at.windows(5) {
        assert!(pair[4] - pair[0] >= Duration::from_secs(1), "{:?}", pair);
    }
    assert_eq!(limiter.stats().total_requests, 12);
}

#[tokio::test(start_paused = true)]
async fn test_token_bucket_burst_then_drain() {
    let bucket = TokenBucketRateLimiter::new(TokenBucketConfig::new(2.0, 4.0)).unwrap();
    for _ in 0..4 {
        assert!(bucket.try_acquire(1.0));
    }
    assert!(!bucket.try_acquire(1.0));

    let start = Instant::now();
    bucket.acquire(2.0).await.unwrap();
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(990) && waited < Duration::from_millis(1_100));

    assert!(bucket.acquire(5.0).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_adaptive_limiter_honours_retry_after() {
    let inner = RateLimiter::per_minute(120).unwrap();
    let adaptive = AdaptiveRateLimiter::new(inner, AdaptiveConfig::default()).unwrap();

    adaptive.report_error(ErrorClass::RateLimited);
    adaptive.report_retry_after(Duration::from_secs(5));

    let start = Instant::now();
    adaptive.acquire().await;
    // 5s block plus (2 - 1) * 0.5s penalty
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(5_500), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(6));

    adaptive.report_success();
    assert!(adaptive.multiplier() < 2.0);
}
