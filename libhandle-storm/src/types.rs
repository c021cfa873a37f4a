use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

use crate::{
    controller::ControllerConfig, credential::PoolConfig, endpoint::RouterConfig,
    generator::GeneratorConfig, store::CooldownPolicy,
};

/// Status code recorded when no HTTP response was received at all.
pub const TRANSPORT_FAILURE: u16 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub candidate: String,
    pub is_available: bool,
    pub status_code: u16,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub is_error: bool,
}

impl CheckOutcome {
    pub fn available(candidate: &str, message: impl Into<String>) -> Self {
        Self::new(candidate, true, 200, message, false)
    }

    pub fn taken(candidate: &str, message: impl Into<String>) -> Self {
        Self::new(candidate, false, 200, message, false)
    }

    pub fn error(candidate: &str, status_code: u16, message: impl Into<String>) -> Self {
        Self::new(candidate, false, status_code, message, true)
    }

    fn new(
        candidate: &str,
        is_available: bool,
        status_code: u16,
        message: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            candidate: candidate.to_string(),
            is_available,
            status_code,
            message: message.into(),
            timestamp: Utc::now(),
            is_error,
        }
    }

    /// A definitive answer from the upstream: available, or taken/invalid.
    pub fn is_definitive(&self) -> bool {
        !self.is_error
    }

    pub fn is_transport_failure(&self) -> bool {
        self.status_code == TRANSPORT_FAILURE
    }
}

/// Tunable state owned by the adaptive controller and consumed by the generator.
///
/// Serialized with camelCase keys; this JSON shape is what survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveParameters {
    pub concurrency_target: usize,
    pub length_weights: BTreeMap<usize, f64>,
    pub separator_probability: f64,
    pub digit_probability: f64,
    pub upper_case_probability: f64,
}

impl Default for AdaptiveParameters {
    fn default() -> Self {
        Self {
            concurrency_target: 10,
            length_weights: default_length_weights(),
            separator_probability: 0.2,
            digit_probability: 0.3,
            upper_case_probability: 0.4,
        }
    }
}

pub fn default_length_weights() -> BTreeMap<usize, f64> {
    BTreeMap::from([
        (3, 30.0),
        (4, 25.0),
        (5, 20.0),
        (6, 15.0),
        (7, 5.0),
        (8, 3.0),
        (9, 2.0),
    ])
}

/// Where the upstream lives and how requests are authenticated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub endpoints: Vec<EndpointSpec>,
    /// Header carrying the credential, e.g. `Cookie` or `Authorization`.
    pub credential_header: String,
    /// Header value with `{token}` replaced by the credential secret.
    pub credential_format: String,
    /// Response `code` that means the name is free.
    pub available_code: i64,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![EndpointSpec {
                name: "auth-v1".to_string(),
                url_template:
                    "https://auth.roblox.com/v1/usernames/validate?request.username={name}&request.birthday=2000-01-01"
                        .to_string(),
            }],
            credential_header: "Cookie".to_string(),
            credential_format: ".ROBLOSECURITY={token}".to_string(),
            available_code: 0,
            user_agent: concat!("handle-storm/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    /// URL with `{name}` replaced by the candidate.
    pub url_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    #[serde(with = "secs")]
    pub timeout: Duration,
    /// How long an in-memory result stays valid.
    #[serde(with = "secs")]
    pub cache_ttl: Duration,
    /// Jitter range slept between driver batches.
    #[serde(with = "secs")]
    pub batch_pause_min: Duration,
    #[serde(with = "secs")]
    pub batch_pause_max: Duration,
    /// Batches between scheduled controller recomputes.
    pub adapt_every_batches: u32,
    /// Store records older than this are removed when a run starts.
    #[serde(with = "secs")]
    pub retention: Duration,
    pub upstream: UpstreamConfig,
    pub credentials: PoolConfig,
    pub router: RouterConfig,
    pub generator: GeneratorConfig,
    pub controller: ControllerConfig,
    pub store: CooldownPolicy,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            cache_ttl: Duration::from_secs(60),
            batch_pause_min: Duration::from_millis(250),
            batch_pause_max: Duration::from_millis(750),
            adapt_every_batches: 5,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            upstream: UpstreamConfig::default(),
            credentials: PoolConfig::default(),
            router: RouterConfig::default(),
            generator: GeneratorConfig::default(),
            controller: ControllerConfig::default(),
            store: CooldownPolicy::default(),
        }
    }
}

/// Durations in config files are written as fractional seconds.
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_constructors_set_error_flags() {
        assert!(CheckOutcome::available("abc", "ok").is_definitive());
        assert!(!CheckOutcome::taken("abc", "Code: 1").is_available);
        let failed = CheckOutcome::error("abc", TRANSPORT_FAILURE, "timeout");
        assert!(failed.is_error);
        assert!(failed.is_transport_failure());
        assert!(!CheckOutcome::error("abc", 429, "rate limited").is_transport_failure());
    }

    #[test]
    fn config_durations_parse_from_seconds() {
        let config: ProbeConfig =
            serde_json::from_str(r#"{"timeout": 2.5, "cache_ttl": 30}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.adapt_every_batches, 5);
    }
}
