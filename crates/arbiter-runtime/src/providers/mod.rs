//! Provider transport abstractions for arbiter-runtime.
//!
//! This module defines the opaque transport client the dispatch core
//! calls through, and the factory registry the client pool uses to
//! build clients on first use. Concrete HTTP transports live with the
//! collaborators that own provider credentials; the dispatch core only
//! ever sees the [`ProviderClient`] trait.
//!
//! ## Security
//!
//! Key material resolved from target configuration is wrapped in
//! [`secrecy::SecretString`] so it cannot be accidentally logged.

use async_trait::async_trait;
use secrecy::SecretString;

use arbiter_core::{CompletionResponse, ModelTarget, PromptPayload, ProviderError};

mod factory;

pub use factory::{ClientFactory, ClientRegistry};

/// Opaque transport client for one (provider, model, configuration) key.
///
/// Implementations own the wire protocol and authentication for one
/// provider family. The pool creates them lazily through a
/// [`ClientFactory`] and leases them to one call at a time; a client is
/// never shared outside an acquire/release cycle.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Execute one completion attempt.
    async fn complete(&self, payload: &PromptPayload) -> Result<CompletionResponse, ProviderError>;

    /// Provider identifier for records and metrics.
    fn provider(&self) -> &str;

    /// Model identifier for records and metrics.
    fn model(&self) -> &str;
}

/// Resolve API-key material for a target.
///
/// Checks the target configuration's `api_key` field first, then the
/// given environment variable. Creation-time credential failures are
/// fatal: the pool surfaces them without retrying.
pub fn resolve_api_key(target: &ModelTarget, env_var: &str) -> Result<SecretString, ProviderError> {
    if let Some(key) = target.config.get("api_key").and_then(|v| v.as_str()) {
        if key.is_empty() {
            return Err(ProviderError::Auth);
        }
        return Ok(SecretString::from(key.to_string()));
    }

    match std::env::var(env_var) {
        Ok(key) if !key.is_empty() => Ok(SecretString::from(key)),
        _ => Err(ProviderError::Auth),
    }
}
