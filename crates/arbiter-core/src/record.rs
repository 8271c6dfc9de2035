//! Immutable audit records for individual call attempts.
//!
//! Every physical attempt against a provider yields exactly one
//! [`InteractionRecord`], whether it succeeded or not. A logical call
//! that retried twice therefore carries up to three records on its
//! [`CallResult`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::time::Duration;

use crate::payload::{CompletionResponse, TokenUsage};

/// Audit entry for one physical call attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRecord {
    /// When the attempt started
    pub timestamp: DateTime<Utc>,

    /// Provider the attempt went to
    pub provider: String,

    /// Model the attempt went to
    pub model: String,

    /// Caller-supplied purpose tag (e.g. "evaluation", "comparison")
    pub purpose: String,

    /// 1-based attempt number within the logical call
    pub attempt: u32,

    /// Flattened prompt text sent to the provider
    pub prompt: String,

    /// Response content, absent on failure
    pub response: Option<String>,

    /// Token usage, zero on failure
    pub usage: TokenUsage,

    /// Wall-clock latency of the attempt
    #[serde(with = "duration_millis")]
    pub latency: Duration,

    /// Error description when the attempt failed
    pub error: Option<String>,

    /// Free-form metadata contributed by middleware
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, JsonValue>,
}

impl InteractionRecord {
    /// Whether the attempt produced a response.
    pub fn succeeded(&self) -> bool {
        self.response.is_some()
    }
}

/// Aggregate returned to the caller for one logical call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResult {
    /// The final response payload
    pub response: CompletionResponse,

    /// Token usage summed across all attempts
    pub usage: TokenUsage,

    /// One record per physical attempt, in attempt order
    pub interactions: Vec<InteractionRecord>,

    /// Total elapsed time for the logical call, delays included
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl CallResult {
    /// Number of physical attempts made.
    pub fn attempts(&self) -> u32 {
        self.interactions.len() as u32
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
