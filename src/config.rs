//! Policy files: per-client limiter, breaker and retry settings.
//!
//! ```yaml
//! clients:
//!   binance:
//!     rate_limits:
//!       requests_per_second: 20
//!       requests_per_minute: 1200
//!     circuit_breaker:
//!       failure_threshold: 5
//!       recovery_timeout: 30
//!     retry:
//!       max_retries: 3
//!       base_delay: 0.5
//!       strategy: jittered_backoff
//! ```

use crate::client::{GuardedClient, Throttle};
use crate::resilience::adaptive::{AdaptiveConfig, AdaptiveRateLimiter};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::resilience::rate_limiter::RateLimiterConfig;
use crate::resilience::token_bucket::TokenBucketConfig;
use crate::retry::{RetryConfig, RetryHandler};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Environment variable holding the path of the policy file.
pub const CONFIG_ENV: &str = "APIGUARD_CONFIG";

/// Serialize a `Duration` as (fractional) seconds.
pub(crate) mod serde_secs {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if secs < 0.0 {
            return Err(de::Error::custom(format!(
                "expected a non-negative number of seconds, got {}",
                secs
            )));
        }
        Duration::try_from_secs_f64(secs)
            .map_err(|e| de::Error::custom(format!("invalid number of seconds {}: {}", secs, e)))
    }
}

/// Everything needed to guard calls to one dependency.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientPolicy {
    pub rate_limits: Option<RateLimiterConfig>,
    pub token_bucket: Option<TokenBucketConfig>,
    /// Only valid together with `rate_limits`.
    pub adaptive: Option<AdaptiveConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub retry: RetryConfig,
}

impl ClientPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.rate_limits.is_some() && self.token_bucket.is_some() {
            return Err(Error::configuration_with_context(
                "configure either rate_limits or token_bucket, not both",
                ErrorContext::new().with_source("config_loader"),
            ));
        }
        if self.adaptive.is_some() && self.rate_limits.is_none() {
            return Err(Error::configuration_with_context(
                "adaptive throttling requires rate_limits",
                ErrorContext::new()
                    .with_field_path("adaptive")
                    .with_source("config_loader"),
            ));
        }
        if let Some(limits) = &self.rate_limits {
            if limits.limits()?.is_empty() {
                return Err(Error::configuration_with_context(
                    "rate_limits declares no windows",
                    ErrorContext::new()
                        .with_field_path("rate_limits")
                        .with_source("config_loader"),
                ));
            }
        }
        if let Some(bucket) = &self.token_bucket {
            bucket.validate()?;
        }
        if let Some(adaptive) = &self.adaptive {
            adaptive.validate()?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        self.retry.validate()
    }

    pub fn build_throttle(&self) -> Result<Throttle> {
        self.validate()?;
        let throttle = match (&self.rate_limits, &self.token_bucket, &self.adaptive) {
            (Some(limits), _, Some(adaptive)) => {
                Throttle::Adaptive(AdaptiveRateLimiter::new(limits.build()?, adaptive.clone())?)
            }
            (Some(limits), _, None) => Throttle::Window(limits.build()?),
            (None, Some(bucket), _) => Throttle::Bucket(bucket.build()?),
            (None, None, _) => Throttle::Unlimited,
        };
        Ok(throttle)
    }

    pub fn build_retry_handler(&self, name: &str) -> Result<RetryHandler> {
        let handler = RetryHandler::named(name, self.retry.clone())?;
        Ok(match &self.circuit_breaker {
            Some(cfg) => handler.with_circuit_breaker(CircuitBreaker::named(name, cfg.clone())?),
            None => handler,
        })
    }
}

/// Top-level policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub clients: BTreeMap<String, ClientPolicy>,
}

impl ResilienceConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let config = match ext.as_deref() {
            Some("json") => Self::from_json_str(&content)?,
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content)?,
            _ => {
                return Err(Error::configuration_with_context(
                    "unsupported policy file extension",
                    ErrorContext::new()
                        .with_details(path.display().to_string())
                        .with_source("config_loader"),
                ))
            }
        };
        info!(path = %path.display(), clients = config.clients.len(), "loaded resilience policy");
        Ok(config)
    }

    /// Load the file named by [`CONFIG_ENV`], if the variable is set.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()).map(Some),
            _ => Ok(None),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, policy) in &self.clients {
            policy.validate().map_err(|e| match e {
                Error::Configuration { message, context } | Error::Validation { message, context } => {
                    let field = match &context.field_path {
                        Some(f) => format!("clients.{}.{}", name, f),
                        None => format!("clients.{}", name),
                    };
                    Error::configuration_with_context(message, context.with_field_path(field))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    pub fn client(&self, name: &str) -> Option<&ClientPolicy> {
        self.clients.get(name)
    }

    /// Build one [`GuardedClient`] per configured dependency.
    pub fn build_clients(&self) -> Result<BTreeMap<String, GuardedClient>> {
        self.clients
            .iter()
            .map(|(name, policy)| Ok((name.clone(), GuardedClient::from_policy(name, policy)?)))
            .collect()
    }
}
