//! # arbiter-runtime
//!
//! Resilient model-call dispatch for Arbiter evaluators.
//!
//! This crate sits between evaluation collaborators and external model
//! providers. Every outbound call goes through one [`Dispatcher`],
//! which composes:
//!
//! - an ordered middleware chain (logging, metrics, caching, or your
//!   own handlers), outermost first
//! - a per-target circuit breaker that fast-fails calls to a
//!   consistently failing provider
//! - a retry loop with exponential backoff for transient failures
//! - a bounded pool of reusable transport clients
//! - an immutable interaction record for every physical attempt
//!
//! The transport itself is opaque: collaborators register a
//! [`providers::ClientFactory`] per provider family and the pool builds
//! clients lazily.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use arbiter_runtime::{Dispatcher, middleware::LoggingMiddleware};
//! use arbiter_runtime::{ChatMessage, ModelTarget, PromptPayload};
//!
//! let mut registry = arbiter_runtime::providers::ClientRegistry::new();
//! registry.register(Arc::new(MyOpenAiFactory));
//!
//! let dispatcher = Dispatcher::builder()
//!     .registry(registry)
//!     .middleware(Arc::new(LoggingMiddleware::new()))
//!     .build()?;
//!
//! let target = ModelTarget::new("openai", "gpt-4o-mini");
//! let payload = PromptPayload::new(vec![ChatMessage::user("Score this answer.")]);
//! let result = dispatcher
//!     .invoke(&target, payload, "evaluation", Duration::from_secs(30))
//!     .await?;
//! ```

pub mod config;
pub mod dispatcher;
pub mod logging;
pub mod middleware;
pub mod pool;
pub mod providers;
pub mod resilience;
pub mod sink;

// The shared data model, re-exported for collaborators.
pub use arbiter_core::{
    CallResult, ChatMessage, CompletionResponse, ErrorClass, InteractionRecord, ModelTarget,
    PromptPayload, ProviderError, TargetKey, TokenUsage,
};

pub use config::{ConfigError, DispatchConfig};
pub use dispatcher::{DispatchError, Dispatcher, DispatcherBuilder};
pub use middleware::{
    CachingMiddleware, CallContext, CallMetrics, LoggingMiddleware, MetricsMiddleware, Middleware,
    Next,
};
pub use pool::{AcquireMode, ClientLease, ClientPool, PoolConfig, PoolError};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig, RetryPolicy};
pub use sink::{MemorySink, RecordSink, TracingSink};
