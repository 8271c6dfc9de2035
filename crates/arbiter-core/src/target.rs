//! Call targets and the keys derived from them.
//!
//! A [`ModelTarget`] names where a call goes: which provider, which
//! model, and any provider-specific configuration. The derived
//! [`TargetKey`] identifies pool entries and circuit-breaker state.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A (provider, model, configuration) triple identifying a call destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTarget {
    /// Provider identifier (e.g. "openai", "anthropic")
    pub provider: String,

    /// Model identifier (e.g. "gpt-4o-mini")
    pub model: String,

    /// Provider-specific configuration: endpoint, API version,
    /// credential references. Opaque to the dispatch core.
    #[serde(default)]
    pub config: JsonValue,
}

impl ModelTarget {
    /// Create a target with empty configuration.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            config: JsonValue::Null,
        }
    }

    /// Attach provider-specific configuration.
    pub fn with_config(mut self, config: JsonValue) -> Self {
        self.config = config;
        self
    }

    /// The key this target resolves to for pooling and breaker state.
    ///
    /// Targets that differ only in configuration get distinct keys, so
    /// clients built against different endpoints or credentials are
    /// never shared.
    pub fn key(&self) -> TargetKey {
        TargetKey {
            provider: self.provider.clone(),
            model: self.model.clone(),
            config_hash: hash_config(&self.config),
        }
    }
}

/// Hashed identity of a [`ModelTarget`].
///
/// Used to key the client pool's lease table and the per-target
/// circuit-breaker state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    provider: String,
    model: String,
    config_hash: u64,
}

impl TargetKey {
    /// Provider identifier.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Model identifier.
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}#{:08x}",
            self.provider, self.model, self.config_hash
        )
    }
}

fn hash_config(config: &JsonValue) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    // serde_json keeps object keys sorted, so the string form is stable
    // for equal values regardless of insertion order.
    config.to_string().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_same_target_same_key() {
        let a = ModelTarget::new("openai", "gpt-4o-mini");
        let b = ModelTarget::new("openai", "gpt-4o-mini");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_config_changes_key() {
        let plain = ModelTarget::new("openai", "gpt-4o-mini");
        let tuned = ModelTarget::new("openai", "gpt-4o-mini")
            .with_config(json!({"base_url": "https://eu.api.example.com"}));
        assert_ne!(plain.key(), tuned.key());
    }

    #[test]
    fn test_config_key_order_is_stable() {
        let a = ModelTarget::new("openai", "gpt-4o-mini")
            .with_config(json!({"a": 1, "b": 2}));
        let b = ModelTarget::new("openai", "gpt-4o-mini")
            .with_config(json!({"b": 2, "a": 1}));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_key_display() {
        let key = ModelTarget::new("anthropic", "claude-sonnet-4-5").key();
        let shown = key.to_string();
        assert!(shown.starts_with("anthropic/claude-sonnet-4-5#"));
    }
}
