//! Factory pattern for transport-client creation.
//!
//! The client pool does not know how to build clients; it asks a
//! registry of factories, one per provider family. This keeps provider
//! selection out of enums: registering a factory is all it takes to
//! route calls to a new provider.
//!
//! ## Usage
//!
//! ```ignore
//! let mut registry = ClientRegistry::new();
//! registry.register(Arc::new(OpenAiClientFactory));
//!
//! let client = registry.create("openai", &target)?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use arbiter_core::{ModelTarget, ProviderError};

use super::ProviderClient;

/// Factory for creating transport clients for one provider family.
///
/// Each factory is responsible for:
/// 1. Validating the target configuration it is given
/// 2. Creating client instances (resolving credentials as needed)
/// 3. Providing a unique provider-type identifier
pub trait ClientFactory: Send + Sync {
    /// Unique identifier for this provider family.
    ///
    /// Examples: "openai", "anthropic", "gemini", "groq"
    fn provider_type(&self) -> &'static str;

    /// Create a client for the given target.
    ///
    /// Creation may fail, typically on missing or invalid credentials.
    /// Such failures are fatal: the pool surfaces them to the caller
    /// without retrying.
    fn create(&self, target: &ModelTarget) -> Result<Arc<dyn ProviderClient>, ProviderError>;

    /// Human-readable description of this factory.
    fn description(&self) -> &'static str {
        "Provider transport client"
    }
}

/// Registry of available client factories.
///
/// Owned by the client pool; maps provider-type names to factories so
/// clients can be created lazily on first lease for a target.
#[derive(Default)]
pub struct ClientRegistry {
    factories: BTreeMap<String, Arc<dyn ClientFactory>>,
}

impl ClientRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client factory.
    ///
    /// If a factory with the same provider type already exists, it will
    /// be replaced.
    pub fn register(&mut self, factory: Arc<dyn ClientFactory>) {
        self.factories
            .insert(factory.provider_type().to_string(), factory);
    }

    /// Create a client for a target through its provider's factory.
    pub fn create(
        &self,
        provider_type: &str,
        target: &ModelTarget,
    ) -> Result<Arc<dyn ProviderClient>, ProviderError> {
        self.factories
            .get(provider_type)
            .ok_or_else(|| {
                ProviderError::InvalidRequest(format!(
                    "unknown provider type: '{}'. Available: {:?}",
                    provider_type,
                    self.available_types()
                ))
            })?
            .create(target)
    }

    /// List available provider types.
    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    /// Check if a provider type is registered.
    pub fn has_provider(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("providers", &self.available_types())
            .finish()
    }
}
