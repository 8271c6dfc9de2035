//! Circuit breaker to prevent hammering a failing provider.
//!
//! One state machine per (provider, model, configuration) target. After
//! `failure_threshold` consecutive failures the circuit opens and calls
//! to that target fast-fail without a network attempt. Once
//! `open_timeout` elapses, a bounded number of trial calls probe
//! recovery; a successful trial closes the circuit, a failed one
//! reopens it and resets the timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use arbiter_core::TargetKey;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before admitting trial calls
    #[serde(with = "crate::config::duration_str")]
    pub open_timeout: Duration,

    /// Trial calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

/// Observable state of one target's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; failures are counted
    Closed,

    /// Calls fast-fail without a network attempt
    Open,

    /// A bounded number of trial calls probe recovery
    HalfOpen,
}

/// Raised when a call is rejected without a network attempt.
#[derive(Error, Debug)]
#[error("circuit open for {target}")]
pub struct CircuitOpen {
    /// The rejected target
    pub target: TargetKey,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

struct TargetState {
    status: AtomicU8,
    failures: AtomicU32,
    /// Milliseconds since the breaker's epoch at the moment the circuit opened.
    opened_at_ms: AtomicU64,
    /// Trial admissions in the current half-open window.
    trial_calls: AtomicU32,
}

impl TargetState {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(CLOSED),
            failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            trial_calls: AtomicU32::new(0),
        }
    }
}

/// Admission token for one logical call.
///
/// Returned by [`CircuitBreaker::admit`]; passed back with the outcome
/// of every physical attempt the call makes.
pub struct Admission {
    state: Arc<TargetState>,
    key: TargetKey,
    trial: bool,
}

impl Admission {
    /// Whether this call was admitted as a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// Per-target circuit breaker shared by all concurrent calls.
///
/// Every transition is a single compare-and-set on the target's status;
/// check-then-act sequences are deliberately not wrapped in an exclusive
/// lock. As a consequence, admission while half-open is not strictly
/// single-flight: callers racing an Open -> HalfOpen transition can be
/// admitted a couple of extra trials. The overshoot is bounded by the
/// racing callers and is an accepted trade against locking the hot path.
pub struct CircuitBreaker {
    targets: RwLock<HashMap<TargetKey, Arc<TargetState>>>,
    epoch: Instant,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
            config,
        }
    }

    /// Gate one logical call to a target.
    ///
    /// Returns an [`Admission`] when the call may proceed, or
    /// [`CircuitOpen`] when it must fast-fail without a network attempt.
    pub fn admit(&self, key: &TargetKey) -> Result<Admission, CircuitOpen> {
        let state = self.state_for(key);

        match state.status.load(Ordering::Acquire) {
            CLOSED => Ok(Admission {
                state,
                key: key.clone(),
                trial: false,
            }),
            OPEN => {
                let opened_at = state.opened_at_ms.load(Ordering::Acquire);
                if self.now_ms() < opened_at + self.config.open_timeout.as_millis() as u64 {
                    return Err(CircuitOpen {
                        target: key.clone(),
                    });
                }
                if state
                    .status
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // Losers of this race may still see the previous
                    // window's counter; see the type-level note on
                    // admission overshoot.
                    state.trial_calls.store(0, Ordering::Release);
                    tracing::info!(target_key = %key, "circuit half-open, probing recovery");
                }
                self.admit_trial(state, key)
            }
            _ => self.admit_trial(state, key),
        }
    }

    fn admit_trial(
        &self,
        state: Arc<TargetState>,
        key: &TargetKey,
    ) -> Result<Admission, CircuitOpen> {
        let prior = state.trial_calls.fetch_add(1, Ordering::AcqRel);
        if prior < self.config.half_open_max_calls {
            Ok(Admission {
                state,
                key: key.clone(),
                trial: true,
            })
        } else {
            state.trial_calls.fetch_sub(1, Ordering::AcqRel);
            Err(CircuitOpen {
                target: key.clone(),
            })
        }
    }

    /// Record a successful attempt for an admitted call.
    pub fn on_success(&self, admission: &Admission) {
        let state = &admission.state;
        match state.status.load(Ordering::Acquire) {
            HALF_OPEN => {
                if state
                    .status
                    .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    state.failures.store(0, Ordering::Release);
                    tracing::info!(
                        target_key = %admission.key,
                        "circuit closed after successful trial"
                    );
                }
            }
            CLOSED => {
                state.failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    /// Record a failed attempt for an admitted call.
    ///
    /// A per-attempt timeout counts as a failure, same as any transport
    /// error.
    pub fn on_failure(&self, admission: &Admission) {
        let state = &admission.state;
        match state.status.load(Ordering::Acquire) {
            CLOSED => {
                let failures = state.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    state.opened_at_ms.store(self.now_ms(), Ordering::Release);
                    if state
                        .status
                        .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        tracing::warn!(
                            target_key = %admission.key,
                            failures,
                            "circuit opened after repeated failures"
                        );
                    }
                }
            }
            HALF_OPEN => {
                state.opened_at_ms.store(self.now_ms(), Ordering::Release);
                if state
                    .status
                    .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::warn!(
                        target_key = %admission.key,
                        "circuit reopened after failed trial"
                    );
                }
            }
            _ => {}
        }
    }

    /// Current state of a target's circuit.
    ///
    /// Pure read: an open circuit whose timeout has elapsed still
    /// reports Open until a call transitions it.
    pub fn state(&self, key: &TargetKey) -> CircuitState {
        let targets = self.targets.read();
        match targets.get(key) {
            Some(state) => match state.status.load(Ordering::Acquire) {
                OPEN => CircuitState::Open,
                HALF_OPEN => CircuitState::HalfOpen,
                _ => CircuitState::Closed,
            },
            None => CircuitState::Closed,
        }
    }

    /// Reset every target's circuit to closed.
    pub fn reset(&self) {
        self.targets.write().clear();
    }

    fn state_for(&self, key: &TargetKey) -> Arc<TargetState> {
        if let Some(state) = self.targets.read().get(key) {
            return Arc::clone(state);
        }
        let mut targets = self.targets.write();
        Arc::clone(
            targets
                .entry(key.clone())
                .or_insert_with(|| Arc::new(TargetState::new())),
        )
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::ModelTarget;

    fn key() -> TargetKey {
        ModelTarget::new("openai", "gpt-4o-mini").key()
    }

    fn fail_once(breaker: &CircuitBreaker, key: &TargetKey) {
        let admission = breaker.admit(key).unwrap();
        breaker.on_failure(&admission);
    }

    #[test]
    fn test_circuit_starts_closed() {
        let breaker = CircuitBreaker::default();
        assert_eq!(breaker.state(&key()), CircuitState::Closed);
        assert!(breaker.admit(&key()).is_ok());
    }

    #[test]
    fn test_circuit_opens_at_threshold() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            ..Default::default()
        });

        for _ in 0..4 {
            fail_once(&breaker, &key());
            assert_eq!(breaker.state(&key()), CircuitState::Closed);
        }

        fail_once(&breaker, &key());
        assert_eq!(breaker.state(&key()), CircuitState::Open);
        assert!(breaker.admit(&key()).is_err());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });

        fail_once(&breaker, &key());

        let admission = breaker.admit(&key()).unwrap();
        breaker.on_success(&admission);

        // One more failure must not open the circuit after the reset.
        fail_once(&breaker, &key());
        assert_eq!(breaker.state(&key()), CircuitState::Closed);
    }

    #[test]
    fn test_targets_are_independent() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });

        let failing = ModelTarget::new("openai", "gpt-4o-mini").key();
        let healthy = ModelTarget::new("anthropic", "claude-sonnet-4-5").key();

        fail_once(&breaker, &failing);
        assert_eq!(breaker.state(&failing), CircuitState::Open);
        assert_eq!(breaker.state(&healthy), CircuitState::Closed);
        assert!(breaker.admit(&healthy).is_ok());
    }

    #[test]
    fn test_open_fast_fails_before_timeout() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_secs(60),
            ..Default::default()
        });

        fail_once(&breaker, &key());
        assert!(breaker.admit(&key()).is_err());
        assert!(breaker.admit(&key()).is_err());
    }

    #[test]
    fn test_half_open_after_timeout_then_close_on_success() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_millis(20),
            half_open_max_calls: 1,
        });

        fail_once(&breaker, &key());
        assert_eq!(breaker.state(&key()), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));

        let trial = breaker.admit(&key()).unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(&key()), CircuitState::HalfOpen);

        breaker.on_success(&trial);
        assert_eq!(breaker.state(&key()), CircuitState::Closed);

        // Fully recovered: failures were reset with the close.
        assert!(breaker.admit(&key()).is_ok());
    }

    #[test]
    fn test_failed_trial_reopens_and_resets_timer() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_millis(30),
            half_open_max_calls: 1,
        });

        fail_once(&breaker, &key());
        std::thread::sleep(Duration::from_millis(40));

        let trial = breaker.admit(&key()).unwrap();
        breaker.on_failure(&trial);
        assert_eq!(breaker.state(&key()), CircuitState::Open);

        // Timer restarted: still fast-failing right after the reopen.
        assert!(breaker.admit(&key()).is_err());

        std::thread::sleep(Duration::from_millis(40));
        assert!(breaker.admit(&key()).is_ok());
    }

    #[test]
    fn test_half_open_admission_is_bounded() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_millis(10),
            half_open_max_calls: 1,
        });

        fail_once(&breaker, &key());
        std::thread::sleep(Duration::from_millis(20));

        let admitted: usize = (0..8)
            .map(|_| breaker.admit(&key()).is_ok() as usize)
            .sum();
        assert_eq!(admitted, 1, "sequential admission admits exactly one trial");
    }

    #[test]
    fn test_concurrent_half_open_overshoot_is_bounded() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_millis(10),
            half_open_max_calls: 1,
        };
        let breaker = Arc::new(CircuitBreaker::new(config.clone()));

        fail_once(&breaker, &key());
        std::thread::sleep(Duration::from_millis(20));

        let admitted = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let breaker = Arc::clone(&breaker);
            let admitted = Arc::clone(&admitted);
            handles.push(std::thread::spawn(move || {
                if breaker.admit(&key()).is_ok() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let admitted = admitted.load(Ordering::SeqCst);
        assert!(admitted >= 1, "at least one trial must be admitted");
        // Admission is deliberately not single-flight; tolerate a small
        // overshoot but never an unbounded one.
        assert!(
            admitted <= config.half_open_max_calls + 2,
            "admitted {admitted} trials"
        );
    }
}
