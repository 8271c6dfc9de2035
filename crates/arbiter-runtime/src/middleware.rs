//! Cross-cutting middleware wrapping every dispatched call.
//!
//! Middleware are composed into an ordered chain: the first handler is
//! outermost. Each handler sees the call context before delegating to
//! the rest of the chain and the result (or error) after, and may
//! short-circuit by returning without delegating. A cache hit, for
//! example, never reaches the circuit breaker or the pool and records
//! no interaction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use moka::future::Cache;
use parking_lot::Mutex;
use serde_json::{Map, Value as JsonValue};

use arbiter_core::{
    CallResult, CompletionResponse, ModelTarget, PromptPayload, TargetKey, TokenUsage,
};

use crate::dispatcher::DispatchError;

/// Per-call mutable envelope threaded through the middleware chain.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Where the call goes
    pub target: ModelTarget,

    /// What is being sent
    pub payload: PromptPayload,

    /// Caller-supplied purpose tag
    pub purpose: String,

    /// Per-attempt timeout for the transport call
    pub attempt_timeout: Duration,

    /// Free-form metadata accumulated along the chain; copied onto
    /// every interaction record the call produces
    pub metadata: Map<String, JsonValue>,
}

/// Boxed future returned through the chain.
pub type CallFuture<'a> = BoxFuture<'a, Result<CallResult, DispatchError>>;

/// The innermost call the chain bottoms out in.
pub(crate) trait TerminalCall: Send + Sync {
    fn call<'a>(&'a self, ctx: &'a mut CallContext) -> CallFuture<'a>;
}

/// Handle to the remainder of the middleware chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn TerminalCall,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], terminal: &'a dyn TerminalCall) -> Self {
        Self { chain, terminal }
    }

    /// Invoke the rest of the chain.
    pub async fn run(self, ctx: &mut CallContext) -> Result<CallResult, DispatchError> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle(ctx, Next::new(rest, self.terminal)).await
            }
            None => self.terminal.call(ctx).await,
        }
    }
}

/// A cross-cutting handler composed into the dispatch chain.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process one call.
    ///
    /// Implementations may transform the context before delegating,
    /// observe or replace the result after, or return without invoking
    /// `next` to short-circuit the call entirely.
    async fn handle(
        &self,
        ctx: &mut CallContext,
        next: Next<'_>,
    ) -> Result<CallResult, DispatchError>;
}

/// Logs every call through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    /// Create a logging middleware.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        ctx: &mut CallContext,
        next: Next<'_>,
    ) -> Result<CallResult, DispatchError> {
        let started = Instant::now();
        tracing::debug!(
            provider = %ctx.target.provider,
            model = %ctx.target.model,
            purpose = %ctx.purpose,
            "dispatching model call"
        );

        let result = next.run(ctx).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(call) => tracing::info!(
                provider = %ctx.target.provider,
                model = %ctx.target.model,
                purpose = %ctx.purpose,
                attempts = call.attempts(),
                tokens = call.usage.total(),
                latency_ms,
                "model call completed"
            ),
            Err(error) => tracing::warn!(
                provider = %ctx.target.provider,
                model = %ctx.target.model,
                purpose = %ctx.purpose,
                latency_ms,
                error = %error,
                "model call failed"
            ),
        }

        result
    }
}

/// Aggregated counters over every call that passed through.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallMetrics {
    /// Calls observed, failures included
    pub total_requests: u64,

    /// Summed wall-clock time across calls
    pub total_time: Duration,

    /// Mean wall-clock time per call
    pub avg_time_per_request: Duration,

    /// Summed token usage of successful calls
    pub tokens_used: u64,

    /// Calls that surfaced an error
    pub failures: u64,
}

/// Collects call metrics; keep a handle to read the snapshot.
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    inner: Mutex<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    total_requests: u64,
    total_time: Duration,
    tokens_used: u64,
    failures: u64,
}

impl MetricsMiddleware {
    /// Create a metrics middleware.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current aggregated metrics.
    pub fn snapshot(&self) -> CallMetrics {
        let inner = self.inner.lock();
        let avg = if inner.total_requests > 0 {
            inner.total_time / inner.total_requests as u32
        } else {
            Duration::ZERO
        };
        CallMetrics {
            total_requests: inner.total_requests,
            total_time: inner.total_time,
            avg_time_per_request: avg,
            tokens_used: inner.tokens_used,
            failures: inner.failures,
        }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle(
        &self,
        ctx: &mut CallContext,
        next: Next<'_>,
    ) -> Result<CallResult, DispatchError> {
        let started = Instant::now();
        let result = next.run(ctx).await;
        let elapsed = started.elapsed();

        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        inner.total_time += elapsed;
        match &result {
            Ok(call) => inner.tokens_used += u64::from(call.usage.total()),
            Err(_) => inner.failures += 1,
        }

        result
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    target: TargetKey,
    fingerprint: u64,
}

/// Serves repeated payloads from memory instead of the provider.
///
/// A hit short-circuits the chain: nothing below this middleware runs,
/// so the call makes no network attempt and records no interaction.
pub struct CachingMiddleware {
    cache: Cache<CacheKey, CompletionResponse>,
}

impl CachingMiddleware {
    /// Create a cache bounded by entry count and time-to-live.
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    /// Number of cached responses.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Drop every cached response.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    fn key_for(ctx: &CallContext) -> CacheKey {
        CacheKey {
            target: ctx.target.key(),
            fingerprint: ctx.payload.fingerprint(),
        }
    }
}

impl Default for CachingMiddleware {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(3600))
    }
}

#[async_trait]
impl Middleware for CachingMiddleware {
    async fn handle(
        &self,
        ctx: &mut CallContext,
        next: Next<'_>,
    ) -> Result<CallResult, DispatchError> {
        let key = Self::key_for(ctx);

        if let Some(response) = self.cache.get(&key).await {
            tracing::debug!(
                provider = %ctx.target.provider,
                model = %ctx.target.model,
                "cache hit, skipping dispatch"
            );
            ctx.metadata
                .insert("cache".to_string(), JsonValue::from("hit"));
            return Ok(CallResult {
                response,
                usage: TokenUsage::default(),
                interactions: Vec::new(),
                elapsed: Duration::ZERO,
            });
        }

        ctx.metadata
            .insert("cache".to_string(), JsonValue::from("miss"));
        let result = next.run(ctx).await?;
        self.cache.insert(key, result.response.clone()).await;
        Ok(result)
    }
}
