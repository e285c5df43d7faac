use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Re-check delay used when a computed wait rounds down to nothing.
pub(crate) const MIN_RECHECK: Duration = Duration::from_millis(10);

/// Longest single sleep before admission is re-evaluated.
pub(crate) const MAX_RECHECK: Duration = Duration::from_secs(60 * 60);

/// Longest window a [`RateLimit`] may span.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

pub(crate) fn recheck_delay(wait: Duration) -> Duration {
    if wait.is_zero() {
        MIN_RECHECK
    } else {
        wait.min(MAX_RECHECK)
    }
}

/// A single quota: at most `requests` admissions in any trailing `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimit", into = "RawRateLimit")]
pub struct RateLimit {
    requests: u32,
    window: Duration,
}

#[derive(Serialize, Deserialize)]
struct RawRateLimit {
    requests: u32,
    window_seconds: f64,
}

impl TryFrom<RawRateLimit> for RateLimit {
    type Error = Error;

    fn try_from(raw: RawRateLimit) -> Result<Self> {
        if !raw.window_seconds.is_finite() || raw.window_seconds <= 0.0 {
            return Err(Error::validation_with_context(
                "window_seconds must be a positive number",
                ErrorContext::new()
                    .with_field_path("rate_limit.window_seconds")
                    .with_details(format!("got {}", raw.window_seconds))
                    .with_source("rate_limiter"),
            ));
        }
        let window = Duration::try_from_secs_f64(raw.window_seconds).map_err(|e| {
            Error::validation_with_context(
                "window_seconds is out of range",
                ErrorContext::new()
                    .with_field_path("rate_limit.window_seconds")
                    .with_details(format!("got {}: {}", raw.window_seconds, e))
                    .with_source("rate_limiter"),
            )
        })?;
        RateLimit::new(raw.requests, window)
    }
}

impl From<RateLimit> for RawRateLimit {
    fn from(limit: RateLimit) -> Self {
        Self {
            requests: limit.requests,
            window_seconds: limit.window.as_secs_f64(),
        }
    }
}

impl RateLimit {
    pub fn new(requests: u32, window: Duration) -> Result<Self> {
        if requests == 0 {
            return Err(Error::validation_with_context(
                "requests must be greater than zero",
                ErrorContext::new()
                    .with_field_path("rate_limit.requests")
                    .with_source("rate_limiter"),
            ));
        }
        if window.is_zero() {
            return Err(Error::validation_with_context(
                "window must be greater than zero",
                ErrorContext::new()
                    .with_field_path("rate_limit.window_seconds")
                    .with_source("rate_limiter"),
            ));
        }
        if window > MAX_WINDOW {
            return Err(Error::validation_with_context(
                "window must not exceed 366 days",
                ErrorContext::new()
                    .with_field_path("rate_limit.window_seconds")
                    .with_details(format!("got {:?}", window))
                    .with_source("rate_limiter"),
            ));
        }
        Ok(Self { requests, window })
    }

    pub fn per_second(requests: u32) -> Result<Self> {
        Self::new(requests, Duration::from_secs(1))
    }

    pub fn per_minute(requests: u32) -> Result<Self> {
        Self::new(requests, Duration::from_secs(60))
    }

    pub fn per_hour(requests: u32) -> Result<Self> {
        Self::new(requests, Duration::from_secs(3_600))
    }

    pub fn per_day(requests: u32) -> Result<Self> {
        Self::new(requests, Duration::from_secs(86_400))
    }

    pub fn requests(&self) -> u32 {
        self.requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Average spacing between admissions if the quota were spread evenly.
    pub fn interval(&self) -> Duration {
        self.window / self.requests
    }
}

/// Declarative limiter configuration, usually read from a policy file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub requests_per_second: Option<u32>,
    pub requests_per_minute: Option<u32>,
    pub requests_per_hour: Option<u32>,
    pub requests_per_day: Option<u32>,
    /// Extra windows with arbitrary lengths.
    pub limits: Vec<RateLimit>,
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requests_per_second(mut self, n: u32) -> Self {
        self.requests_per_second = Some(n);
        self
    }

    pub fn with_requests_per_minute(mut self, n: u32) -> Self {
        self.requests_per_minute = Some(n);
        self
    }

    pub fn with_requests_per_hour(mut self, n: u32) -> Self {
        self.requests_per_hour = Some(n);
        self
    }

    pub fn with_requests_per_day(mut self, n: u32) -> Self {
        self.requests_per_day = Some(n);
        self
    }

    pub fn with_limit(mut self, limit: RateLimit) -> Self {
        self.limits.push(limit);
        self
    }

    /// Resolve every configured window into a validated [`RateLimit`].
    pub fn limits(&self) -> Result<Vec<RateLimit>> {
        let mut out = Vec::new();
        if let Some(n) = self.requests_per_second {
            out.push(RateLimit::per_second(n)?);
        }
        if let Some(n) = self.requests_per_minute {
            out.push(RateLimit::per_minute(n)?);
        }
        if let Some(n) = self.requests_per_hour {
            out.push(RateLimit::per_hour(n)?);
        }
        if let Some(n) = self.requests_per_day {
            out.push(RateLimit::per_day(n)?);
        }
        out.extend(self.limits.iter().copied());
        Ok(out)
    }

    pub fn build(&self) -> Result<RateLimiter> {
        RateLimiter::new(self.limits()?)
    }
}

/// Usage of one configured window at query time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowUsage {
    pub window_seconds: f64,
    pub limit: u32,
    pub current_usage: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    /// Number of `acquire` calls that had to wait at least once.
    pub total_waits: u64,
    pub total_wait_time_secs: f64,
    pub windows: Vec<WindowUsage>,
}

#[derive(Debug)]
struct Window {
    limit: RateLimit,
    /// Admission instants, oldest first.
    stamps: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.stamps.front() {
            if now.saturating_duration_since(*oldest) >= self.limit.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn live_count(&self, now: Instant) -> usize {
        self.stamps
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.limit.window)
            .count()
    }

    /// Time until the oldest live stamp leaves the window.
    fn wait_for_slot(&self, now: Instant) -> Duration {
        self.stamps
            .iter()
            .find(|t| now.saturating_duration_since(**t) < self.limit.window)
            .map(|oldest| (*oldest + self.limit.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug)]
struct State {
    windows: Vec<Window>,
    total_requests: u64,
    total_waits: u64,
    total_wait_time: Duration,
}

impl State {
    /// Admit and record one request in every window, or return how long to wait.
    ///
    /// Recording is all-or-nothing across windows.
    fn admit(&mut self, now: Instant) -> Option<Duration> {
        let mut blocked = false;
        let mut wait = Duration::ZERO;
        for w in self.windows.iter_mut() {
            w.prune(now);
            if w.stamps.len() >= w.limit.requests as usize {
                blocked = true;
                wait = wait.max(w.wait_for_slot(now));
            }
        }
        if blocked {
            return Some(wait);
        }
        for w in self.windows.iter_mut() {
            w.stamps.push_back(now);
        }
        self.total_requests += 1;
        None
    }
}

/// Multi-window sliding-log rate limiter.
///
/// - Every configured window must have spare capacity for a request to pass
/// - Waiting happens outside the lock; admission re-checks after each wait
/// - No FIFO ordering between waiters
pub struct RateLimiter {
    limits: Vec<RateLimit>,
    state: Mutex<State>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(limits: Vec<RateLimit>) -> Result<Self> {
        if limits.is_empty() {
            return Err(Error::configuration_with_context(
                "rate limiter needs at least one window",
                ErrorContext::new().with_source("rate_limiter"),
            ));
        }
        let windows = limits
            .iter()
            .map(|limit| Window {
                limit: *limit,
                stamps: VecDeque::with_capacity(limit.requests as usize),
            })
            .collect();
        Ok(Self {
            limits,
            state: Mutex::new(State {
                windows,
                total_requests: 0,
                total_waits: 0,
                total_wait_time: Duration::ZERO,
            }),
        })
    }

    /// Single-window limiter admitting `requests` per minute.
    pub fn per_minute(requests: u32) -> Result<Self> {
        Self::new(vec![RateLimit::per_minute(requests)?])
    }

    pub fn limits(&self) -> &[RateLimit] {
        &self.limits
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_admission(&self, wait_started: Option<Instant>) -> Option<Duration> {
        let mut st = self.lock();
        let now = Instant::now();
        let wait = st.admit(now);
        if wait.is_none() {
            if let Some(start) = wait_started {
                st.total_waits += 1;
                st.total_wait_time += now.saturating_duration_since(start);
            }
        }
        wait
    }

    /// Wait until every window has capacity, then record the request.
    pub async fn acquire(&self) {
        let mut wait_started = None;
        while let Some(wait) = self.poll_admission(wait_started) {
            wait_started.get_or_insert_with(Instant::now);
            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(recheck_delay(wait)).await;
        }
    }

    /// Thread-blocking variant of [`acquire`](Self::acquire) for non-async callers.
    pub fn acquire_blocking(&self) {
        let mut wait_started = None;
        while let Some(wait) = self.poll_admission(wait_started) {
            wait_started.get_or_insert_with(Instant::now);
            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, blocking");
            std::thread::sleep(recheck_delay(wait));
        }
    }

    /// Admit the request only if every window has capacity right now.
    pub fn try_acquire(&self) -> bool {
        self.poll_admission(None).is_none()
    }

    /// Estimated wait before the next request would be admitted. Does not record anything.
    pub fn time_until_available(&self) -> Duration {
        let st = self.lock();
        let now = Instant::now();
        st.windows
            .iter()
            .filter(|w| w.live_count(now) >= w.limit.requests as usize)
            .map(|w| w.wait_for_slot(now))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    pub fn stats(&self) -> RateLimiterStats {
        let st = self.lock();
        let now = Instant::now();
        let windows = st
            .windows
            .iter()
            .map(|w| {
                let current_usage = w.live_count(now);
                WindowUsage {
                    window_seconds: w.limit.window.as_secs_f64(),
                    limit: w.limit.requests,
                    current_usage,
                    percentage: current_usage as f64 / w.limit.requests as f64 * 100.0,
                }
            })
            .collect();
        RateLimiterStats {
            total_requests: st.total_requests,
            total_waits: st.total_waits,
            total_wait_time_secs: st.total_wait_time.as_secs_f64(),
            windows,
        }
    }

    /// Forget all recorded requests and counters.
    pub fn reset(&self) {
        let mut st = self.lock();
        for w in st.windows.iter_mut() {
            w.stamps.clear();
        }
        st.total_requests = 0;
        st.total_waits = 0;
        st.total_wait_time = Duration::ZERO;
    }
}
