//! Retry policies with exponential backoff.
//!
//! Each physical failure is classified transient or fatal; fatal errors
//! propagate immediately, transient ones are retried up to
//! `max_attempts` with a delay of `base_delay * multiplier^(n-2)`
//! before attempt `n`. The delay schedule itself comes from `backon`;
//! the attempt loop stays in the dispatcher so every attempt yields an
//! interaction record.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};

use arbiter_core::{ErrorClass, ProviderError};

/// Serializable retry parameters, as found in named presets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum physical attempts per logical call
    pub max_attempts: u32,

    /// Delay before the second attempt
    #[serde(with = "crate::config::duration_str")]
    pub base_delay: Duration,

    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

/// Immutable retry policy driving the dispatcher's attempt loop.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum physical attempts per logical call
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay: Duration,

    /// Multiplier applied to the delay after each failure
    pub backoff_multiplier: f64,

    /// Maps a transport error to its retry class
    pub classifier: fn(&ProviderError) -> ErrorClass,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .finish()
    }
}

/// Default classifier: the error's own transient/fatal split.
pub fn default_classifier(error: &ProviderError) -> ErrorClass {
    error.class()
}

impl RetryPolicy {
    /// Build a policy from serialized parameters.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            backoff_multiplier: config.backoff_multiplier,
            classifier: default_classifier,
        }
    }

    /// Few attempts, short delays. For latency-sensitive callers.
    pub fn quick() -> Self {
        Self::from_config(&RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        })
    }

    /// The default balance.
    pub fn standard() -> Self {
        Self::from_config(&RetryConfig::default())
    }

    /// Many attempts, longer delays. For batch workloads.
    pub fn persistent() -> Self {
        Self::from_config(&RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        })
    }

    /// Replace the error classifier.
    pub fn with_classifier(mut self, classifier: fn(&ProviderError) -> ErrorClass) -> Self {
        self.classifier = classifier;
        self
    }

    /// Delay before attempt `n` (1-based). The first attempt has no delay.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32 - 2);
        self.base_delay.mul_f64(factor)
    }

    /// The inter-attempt delay schedule, capped at `max_attempts - 1`
    /// entries.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(Duration::from_secs(60))
            .with_factor(self.backoff_multiplier.max(1.0) as f32)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
