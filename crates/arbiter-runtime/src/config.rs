//! Construction-time configuration for the dispatcher.
//!
//! Everything here is supplied when the dispatcher is built; nothing is
//! mutated at runtime. Durations serialize as humantime strings ("30s",
//! "250ms") so configuration files stay readable.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::PoolConfig;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

/// Errors from dispatcher construction.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown retry preset '{0}'")]
    UnknownRetryPreset(String),
}

/// Full configuration surface of the dispatch core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Client pool sizing and acquisition behavior
    #[serde(default)]
    pub pool: PoolConfig,

    /// Per-target circuit breaker thresholds
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,

    /// Named retry presets; "quick", "standard" and "persistent" are
    /// always present unless overridden
    #[serde(default = "default_retry_presets")]
    pub retry_presets: BTreeMap<String, RetryConfig>,

    /// Which preset `invoke` uses
    #[serde(default = "default_retry_preset")]
    pub retry_preset: String,

    /// Optional overall deadline for a logical call; expiry stops
    /// further retries
    #[serde(default, with = "duration_opt_str")]
    pub overall_deadline: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            retry_presets: default_retry_presets(),
            retry_preset: default_retry_preset(),
            overall_deadline: None,
        }
    }
}

impl DispatchConfig {
    /// Look up a retry preset by name.
    pub fn retry_config(&self, name: &str) -> Result<&RetryConfig, ConfigError> {
        self.retry_presets
            .get(name)
            .ok_or_else(|| ConfigError::UnknownRetryPreset(name.to_string()))
    }
}

fn default_retry_preset() -> String {
    "standard".to_string()
}

fn default_retry_presets() -> BTreeMap<String, RetryConfig> {
    let mut presets = BTreeMap::new();
    presets.insert(
        "quick".to_string(),
        RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        },
    );
    presets.insert("standard".to_string(), RetryConfig::default());
    presets.insert(
        "persistent".to_string(),
        RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        },
    );
    presets
}

pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

mod duration_opt_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                serializer.serialize_some(&humantime::format_duration(*d).to_string())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|t| humantime::parse_duration(&t).map_err(serde::de::Error::custom))
            .transpose()
    }
}
