//! The call dispatcher: single entry point for model invocations.
//!
//! `invoke` composes, in order: the middleware chain (outermost), the
//! circuit-breaker gate, the retry loop, pool acquire/release, the
//! opaque transport call, and interaction recording. Callers see either
//! a [`CallResult`] or exactly one of the four classified errors, never
//! a raw transport error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Map;
use thiserror::Error;

use arbiter_core::{
    CallResult, CompletionResponse, ErrorClass, InteractionRecord, ModelTarget, PromptPayload,
    ProviderError, TargetKey, TokenUsage,
};

use crate::config::{ConfigError, DispatchConfig};
use crate::middleware::{CallContext, CallFuture, Middleware, Next, TerminalCall};
use crate::pool::{ClientPool, PoolError};
use crate::providers::ClientRegistry;
use crate::resilience::{CircuitBreaker, CircuitState, RetryPolicy};
use crate::sink::{RecordSink, TracingSink};

/// Errors surfaced to callers of [`Dispatcher::invoke`].
///
/// Transient transport errors never appear here; the retry loop absorbs
/// them. Every variant that follows at least one physical attempt
/// carries the records gathered before the failure.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A fatal provider error: authentication or request validation.
    /// Never retried.
    #[error("fatal provider error: {source}")]
    ProviderFatal {
        source: ProviderError,
        interactions: Vec<InteractionRecord>,
    },

    /// The pool was at capacity and the configured mode gave up.
    #[error("client pool exhausted ({max_clients} clients leased)")]
    PoolExhausted {
        max_clients: usize,
        interactions: Vec<InteractionRecord>,
    },

    /// The target's circuit rejected the call before any attempt.
    #[error("circuit open for {target}")]
    CircuitOpen { target: TargetKey },

    /// Every allowed attempt failed with a transient error.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        source: ProviderError,
        interactions: Vec<InteractionRecord>,
    },
}

impl DispatchError {
    /// Records for the attempts made before the failure.
    ///
    /// Empty for [`DispatchError::CircuitOpen`], which precedes any
    /// attempt.
    pub fn interactions(&self) -> &[InteractionRecord] {
        match self {
            Self::ProviderFatal { interactions, .. }
            | Self::PoolExhausted { interactions, .. }
            | Self::RetryExhausted { interactions, .. } => interactions,
            Self::CircuitOpen { .. } => &[],
        }
    }
}

/// Dispatches model calls through the resilience stack.
///
/// One dispatcher instance is shared by all concurrent callers; the
/// client pool and per-target breaker state are the only cross-call
/// mutable state, and both own their synchronization. No module-level
/// singletons.
pub struct Dispatcher {
    pool: ClientPool,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    middleware: Vec<Arc<dyn Middleware>>,
    sink: Arc<dyn RecordSink>,
    overall_deadline: Option<Duration>,
}

impl Dispatcher {
    /// Start building a dispatcher.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Execute one logical model call.
    ///
    /// `timeout` bounds each physical attempt; an expired attempt counts
    /// as a transient failure. The middleware chain wraps everything,
    /// so a short-circuiting handler can answer without any attempt
    /// being made.
    pub async fn invoke(
        &self,
        target: &ModelTarget,
        payload: PromptPayload,
        purpose: &str,
        timeout: Duration,
    ) -> Result<CallResult, DispatchError> {
        let mut ctx = CallContext {
            target: target.clone(),
            payload,
            purpose: purpose.to_string(),
            attempt_timeout: timeout,
            metadata: Map::new(),
        };

        let core = CoreCall { dispatcher: self };
        Next::new(&self.middleware, &core).run(&mut ctx).await
    }

    /// Current circuit state for a target key.
    pub fn circuit_state(&self, key: &TargetKey) -> CircuitState {
        self.breaker.state(key)
    }

    /// Reset every target's circuit to closed.
    pub fn reset_circuits(&self) {
        self.breaker.reset();
    }

    /// Breaker gate, retry loop, pool lease and transport call for one
    /// logical call. Reached through the middleware chain.
    async fn execute(&self, ctx: &mut CallContext) -> Result<CallResult, DispatchError> {
        let started = Instant::now();
        let key = ctx.target.key();

        let admission = self
            .breaker
            .admit(&key)
            .map_err(|open| DispatchError::CircuitOpen {
                target: open.target,
            })?;

        let mut interactions: Vec<InteractionRecord> = Vec::new();
        let mut delays = self.retry.backoff();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let lease = match self.pool.acquire(&ctx.target).await {
                Ok(lease) => lease,
                Err(PoolError::Exhausted { max_clients, .. }) => {
                    return Err(DispatchError::PoolExhausted {
                        max_clients,
                        interactions,
                    });
                }
                Err(PoolError::Creation(source)) => {
                    return Err(DispatchError::ProviderFatal {
                        source,
                        interactions,
                    });
                }
            };

            let timestamp = Utc::now();
            let attempt_started = Instant::now();
            let outcome = match tokio::time::timeout(
                ctx.attempt_timeout,
                lease.client().complete(&ctx.payload),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(ctx.attempt_timeout)),
            };
            let latency = attempt_started.elapsed();

            // Free the client before any backoff delay.
            drop(lease);

            let record = build_record(ctx, attempt, timestamp, latency, &outcome);
            self.sink.append(&record);
            interactions.push(record);

            match outcome {
                Ok(response) => {
                    self.breaker.on_success(&admission);
                    let mut usage = TokenUsage::default();
                    for interaction in &interactions {
                        usage.add(&interaction.usage);
                    }
                    return Ok(CallResult {
                        response,
                        usage,
                        interactions,
                        elapsed: started.elapsed(),
                    });
                }
                Err(error) => {
                    self.breaker.on_failure(&admission);

                    if (self.retry.classifier)(&error) == ErrorClass::Fatal {
                        return Err(DispatchError::ProviderFatal {
                            source: error,
                            interactions,
                        });
                    }
                    if attempt >= self.retry.max_attempts {
                        return Err(DispatchError::RetryExhausted {
                            attempts: attempt,
                            source: error,
                            interactions,
                        });
                    }

                    let delay = match delays.next() {
                        Some(delay) => delay,
                        None => self.retry.delay_before(attempt + 1),
                    };
                    if let Some(deadline) = self.overall_deadline {
                        if started.elapsed() + delay >= deadline {
                            tracing::warn!(
                                target_key = %key,
                                attempts = attempt,
                                "overall deadline reached, abandoning retries"
                            );
                            return Err(DispatchError::RetryExhausted {
                                attempts: attempt,
                                source: ProviderError::Timeout(deadline),
                                interactions,
                            });
                        }
                    }

                    tracing::debug!(
                        target_key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

struct CoreCall<'d> {
    dispatcher: &'d Dispatcher,
}

impl TerminalCall for CoreCall<'_> {
    fn call<'a>(&'a self, ctx: &'a mut CallContext) -> CallFuture<'a> {
        Box::pin(self.dispatcher.execute(ctx))
    }
}

fn build_record(
    ctx: &CallContext,
    attempt: u32,
    timestamp: chrono::DateTime<Utc>,
    latency: Duration,
    outcome: &Result<CompletionResponse, ProviderError>,
) -> InteractionRecord {
    let (response, usage, error) = match outcome {
        Ok(response) => (Some(response.content.clone()), response.usage, None),
        Err(e) => (None, TokenUsage::default(), Some(e.to_string())),
    };

    InteractionRecord {
        timestamp,
        provider: ctx.target.provider.clone(),
        model: ctx.target.model.clone(),
        purpose: ctx.purpose.clone(),
        attempt,
        prompt: ctx.payload.prompt_text(),
        response,
        usage,
        latency,
        error,
        metadata: ctx.metadata.clone(),
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    config: DispatchConfig,
    registry: ClientRegistry,
    middleware: Vec<Arc<dyn Middleware>>,
    sink: Option<Arc<dyn RecordSink>>,
    classifier: Option<fn(&ProviderError) -> ErrorClass>,
}

impl DispatcherBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: DispatchConfig::default(),
            registry: ClientRegistry::new(),
            middleware: Vec::new(),
            sink: None,
            classifier: None,
        }
    }

    /// Replace the configuration.
    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Supply the client factory registry.
    pub fn registry(mut self, registry: ClientRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Append a middleware; the first appended is outermost.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Replace the record sink (default: [`TracingSink`]).
    pub fn sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the retry error classifier.
    pub fn classifier(mut self, classifier: fn(&ProviderError) -> ErrorClass) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Build the dispatcher.
    pub fn build(self) -> Result<Dispatcher, ConfigError> {
        let retry_config = self.config.retry_config(&self.config.retry_preset)?.clone();
        let mut retry = RetryPolicy::from_config(&retry_config);
        if let Some(classifier) = self.classifier {
            retry = retry.with_classifier(classifier);
        }

        Ok(Dispatcher {
            pool: ClientPool::new(self.registry, self.config.pool.clone()),
            breaker: CircuitBreaker::new(self.config.breaker.clone()),
            retry,
            middleware: self.middleware,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
            overall_deadline: self.config.overall_deadline,
        })
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
