//! Error classification for retry and throttling decisions.
//!
//! Every dependency error is mapped once, at the call site, onto a closed set of
//! [`ErrorClass`] variants. Retry filters and adaptive throttling only ever look at the
//! class, never at concrete error types.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Coarse failure category of a dependency error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network blips, timeouts, 5xx responses. Usually worth retrying.
    Transient,
    /// The dependency rejected the call for quota reasons (HTTP 429).
    RateLimited,
    /// Bad request, auth failure, programming error. Retrying cannot help.
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an error onto an [`ErrorClass`].
///
/// Implement this once per dependency error type.
pub trait Classify {
    fn classify(&self) -> ErrorClass;

    /// Server-provided minimum wait before the next attempt, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Classify for ErrorClass {
    fn classify(&self) -> ErrorClass {
        *self
    }
}

impl Classify for crate::Error {
    fn classify(&self) -> ErrorClass {
        match self {
            crate::Error::Io(e) => e.classify(),
            _ => ErrorClass::Permanent,
        }
    }
}

impl Classify for std::io::Error {
    fn classify(&self) -> ErrorClass {
        use std::io::ErrorKind::*;
        match self.kind() {
            TimedOut | Interrupted | WouldBlock | ConnectionReset | ConnectionAborted
            | ConnectionRefused | BrokenPipe | UnexpectedEof => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

impl Classify for reqwest::Error {
    fn classify(&self) -> ErrorClass {
        if let Some(status) = self.status() {
            return classify_status(status.as_u16());
        }
        if self.is_timeout() || self.is_connect() || self.is_request() || self.is_body() {
            return ErrorClass::Transient;
        }
        // Builder, redirect and decode failures are deterministic.
        ErrorClass::Permanent
    }
}

/// Classify an HTTP status code.
///
/// - 429 => rate limited
/// - 408, 425, 5xx => transient
/// - other 4xx => permanent
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::RateLimited,
        408 | 425 => ErrorClass::Transient,
        400..=499 => ErrorClass::Permanent,
        500..=599 => ErrorClass::Transient,
        _ => ErrorClass::Transient,
    }
}

/// Parse a `Retry-After` header given in (possibly fractional) seconds.
///
/// HTTP-date values are not supported and yield `None`.
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let secs: f64 = raw.parse().ok()?;
    if secs < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(429), ErrorClass::RateLimited);
        assert_eq!(classify_status(500), ErrorClass::Transient);
        assert_eq!(classify_status(503), ErrorClass::Transient);
        assert_eq!(classify_status(408), ErrorClass::Transient);
        assert_eq!(classify_status(400), ErrorClass::Permanent);
        assert_eq!(classify_status(401), ErrorClass::Permanent);
        assert_eq!(classify_status(404), ErrorClass::Permanent);
    }

    #[test]
    fn test_io_error_classes() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(timeout.classify(), ErrorClass::Transient);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(denied.classify(), ErrorClass::Permanent);
    }

    #[test]
    fn test_crate_errors_are_permanent() {
        let err = crate::Error::validation_with_context("bad", crate::ErrorContext::new());
        assert_eq!(err.classify(), ErrorClass::Permanent);

        let io: crate::Error = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "rst").into();
        assert_eq!(io.classify(), ErrorClass::Transient);
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert!(retry_after_from_headers(&headers).is_none());

        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(retry_after_from_headers(&headers), Some(Duration::from_secs(30)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("1.5"));
        assert_eq!(
            retry_after_from_headers(&headers),
            Some(Duration::from_millis(1500))
        );

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert!(retry_after_from_headers(&headers).is_none());
    }

    #[test]
    fn test_out_of_range_retry_after_is_ignored() {
        let mut headers = HeaderMap::new();
        for raw in ["99999999999999999999", "1e400", "NaN", "-5"] {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(raw));
            assert!(retry_after_from_headers(&headers).is_none(), "{}", raw);
        }
    }

    #[test]
    fn test_error_class_serde_names() {
        let json = serde_json::to_string(&ErrorClass::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");
        let back: ErrorClass = serde_json::from_str("\"transient\"").unwrap();
        assert_eq!(back, ErrorClass::Transient);
    }
}
