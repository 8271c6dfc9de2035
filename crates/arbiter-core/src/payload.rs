//! Prompt payloads and completion responses.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A chat message for model completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,

    /// Message content
    pub content: String,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// The prompt and sampling parameters for one logical call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPayload {
    /// Ordered chat messages
    pub messages: Vec<ChatMessage>,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Temperature (0.0 for deterministic)
    pub temperature: f32,
}

impl PromptPayload {
    /// Create a payload with default sampling parameters.
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: 500,
            temperature: 0.0,
        }
    }

    /// Set the generation token limit.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Flattened prompt text, used for audit records.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Stable hash over messages and sampling parameters.
    ///
    /// Two payloads with equal content share a fingerprint; used as the
    /// identity for response caching.
    pub fn fingerprint(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        let mut hasher = DefaultHasher::new();
        for message in &self.messages {
            message.role.hash(&mut hasher);
            message.content.hash(&mut hasher);
        }
        self.max_tokens.hash(&mut hasher);
        self.temperature.to_bits().hash(&mut hasher);
        hasher.finish()
    }
}

/// Response from a model completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated content
    pub content: String,

    /// Token usage for this completion
    pub usage: TokenUsage,

    /// Model that produced the response
    pub model: String,

    /// Stop reason, when the provider reports one
    pub stop_reason: Option<String>,
}

/// Token usage from a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u32,

    /// Tokens in the completion
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Total tokens used.
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Accumulate usage from another attempt.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}
