//! Resilience patterns for arbiter-runtime.
//!
//! This module provides:
//! - Circuit breaker to stop hammering a failing target
//! - Retry policies with exponential backoff

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitOpen, CircuitState,
};
pub use retry::{default_classifier, RetryConfig, RetryPolicy};
