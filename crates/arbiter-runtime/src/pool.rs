//! Bounded pool of reusable provider-client handles.
//!
//! The pool caps how many clients may be leased at once across all
//! targets, creates clients lazily through the [`ClientRegistry`] on
//! first lease for a target key, and evicts idle clients after a TTL to
//! bound memory. Acquisition either queues with a timeout or fails fast,
//! per configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use arbiter_core::{ModelTarget, ProviderError, TargetKey};

use crate::providers::{ClientRegistry, ProviderClient};

/// Errors from pool acquisition.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("client pool exhausted ({max_clients} clients leased, waited {waited:?})")]
    Exhausted { max_clients: usize, waited: Duration },

    #[error("client construction failed: {0}")]
    Creation(#[from] ProviderError),
}

/// What acquisition does when the pool is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// Wait for a lease to free up, up to `acquire_timeout`.
    Queue,

    /// Fail immediately with an exhaustion error.
    FailFast,
}

/// Client pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrently leased clients across all targets
    pub max_clients: usize,

    /// How long a queued acquirer waits before giving up
    #[serde(with = "crate::config::duration_str")]
    pub acquire_timeout: Duration,

    /// Behavior at capacity
    pub mode: AcquireMode,

    /// Idle clients older than this are dropped on the next acquire
    #[serde(with = "crate::config::duration_str")]
    pub idle_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_clients: 8,
            acquire_timeout: Duration::from_secs(30),
            mode: AcquireMode::Queue,
            idle_ttl: Duration::from_secs(300),
        }
    }
}

struct IdleEntry {
    client: Arc<dyn ProviderClient>,
    last_used: Instant,
}

struct PoolInner {
    registry: ClientRegistry,
    capacity: Arc<Semaphore>,
    idle: Mutex<HashMap<TargetKey, Vec<IdleEntry>>>,
    config: PoolConfig,
}

/// Bounded set of reusable provider clients.
///
/// One pool instance is shared by all concurrent `invoke` calls; the
/// lease table is the only cross-call state it holds, protected by a
/// short-lived mutex on the cold path and a semaphore for capacity.
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

impl ClientPool {
    /// Create a pool over the given factory registry.
    pub fn new(registry: ClientRegistry, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                registry,
                capacity: Arc::new(Semaphore::new(config.max_clients)),
                idle: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Lease a client for the target.
    ///
    /// Reuses an idle client for the same target key when one exists,
    /// otherwise creates one through the registry. Dropping the returned
    /// lease releases the client for reuse.
    pub async fn acquire(&self, target: &ModelTarget) -> Result<ClientLease, PoolError> {
        let permit = self.wait_for_capacity().await?;
        let key = target.key();

        let reused = {
            let mut idle = self.inner.idle.lock();
            if let Some(entries) = idle.get_mut(&key) {
                entries.retain(|e| e.last_used.elapsed() < self.inner.config.idle_ttl);
                entries.pop().map(|e| e.client)
            } else {
                None
            }
        };

        let client = match reused {
            Some(client) => client,
            None => {
                tracing::debug!(target_key = %key, "creating provider client");
                self.inner.registry.create(&target.provider, target)?
            }
        };

        Ok(ClientLease {
            client,
            key,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    async fn wait_for_capacity(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        let capacity = Arc::clone(&self.inner.capacity);
        match self.inner.config.mode {
            AcquireMode::FailFast => capacity.try_acquire_owned().map_err(|_| {
                PoolError::Exhausted {
                    max_clients: self.inner.config.max_clients,
                    waited: Duration::ZERO,
                }
            }),
            AcquireMode::Queue => {
                let timeout = self.inner.config.acquire_timeout;
                match tokio::time::timeout(timeout, capacity.acquire_owned()).await {
                    Ok(Ok(permit)) => Ok(permit),
                    // The semaphore is never closed while the pool is alive.
                    Ok(Err(_)) | Err(_) => Err(PoolError::Exhausted {
                        max_clients: self.inner.config.max_clients,
                        waited: timeout,
                    }),
                }
            }
        }
    }

    /// Number of clients currently leased out.
    pub fn in_flight(&self) -> usize {
        self.inner.config.max_clients - self.inner.capacity.available_permits()
    }

    /// Number of idle clients held for a target key.
    pub fn idle_count(&self, key: &TargetKey) -> usize {
        self.inner
            .idle
            .lock()
            .get(key)
            .map(|e| e.len())
            .unwrap_or(0)
    }

    /// Drop every idle client past its TTL.
    pub fn purge_idle(&self) {
        let ttl = self.inner.config.idle_ttl;
        let mut idle = self.inner.idle.lock();
        for entries in idle.values_mut() {
            entries.retain(|e| e.last_used.elapsed() < ttl);
        }
        idle.retain(|_, entries| !entries.is_empty());
    }
}

/// RAII lease over a pooled client.
///
/// Holds one unit of pool capacity; dropping the lease returns the
/// client to the idle list with a refreshed last-used stamp.
pub struct ClientLease {
    client: Arc<dyn ProviderClient>,
    key: TargetKey,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl ClientLease {
    /// The leased client.
    pub fn client(&self) -> &dyn ProviderClient {
        self.client.as_ref()
    }

    /// Key of the target this lease serves.
    pub fn target_key(&self) -> &TargetKey {
        &self.key
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        let mut idle = self.pool.idle.lock();
        idle.entry(self.key.clone()).or_default().push(IdleEntry {
            client: Arc::clone(&self.client),
            last_used: Instant::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::{CompletionResponse, PromptPayload, TokenUsage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct IdleClient;

    #[async_trait]
    impl ProviderClient for IdleClient {
        async fn complete(
            &self,
            _payload: &PromptPayload,
        ) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                content: "ok".into(),
                usage: TokenUsage::default(),
                model: "test-model".into(),
                stop_reason: None,
            })
        }

        fn provider(&self) -> &str {
            "mock"
        }

        fn model(&self) -> &str {
            "test-model"
        }
    }

    struct CountingFactory {
        created: Arc<AtomicUsize>,
    }

    impl crate::providers::ClientFactory for CountingFactory {
        fn provider_type(&self) -> &'static str {
            "mock"
        }

        fn create(
            &self,
            _target: &ModelTarget,
        ) -> Result<Arc<dyn ProviderClient>, ProviderError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(IdleClient))
        }
    }

    struct FailingFactory;

    impl crate::providers::ClientFactory for FailingFactory {
        fn provider_type(&self) -> &'static str {
            "mock"
        }

        fn create(
            &self,
            _target: &ModelTarget,
        ) -> Result<Arc<dyn ProviderClient>, ProviderError> {
            Err(ProviderError::Auth)
        }
    }

    fn pool_with(config: PoolConfig) -> (ClientPool, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let mut registry = ClientRegistry::new();
        registry.register(Arc::new(CountingFactory {
            created: Arc::clone(&created),
        }));
        (ClientPool::new(registry, config), created)
    }

    fn target() -> ModelTarget {
        ModelTarget::new("mock", "test-model")
    }

    #[test]
    fn test_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_clients, 8);
        assert_eq!(config.mode, AcquireMode::Queue);
    }

    #[tokio::test]
    async fn test_lease_reuse_after_release() {
        let (pool, created) = pool_with(PoolConfig::default());

        let lease = pool.acquire(&target()).await.unwrap();
        assert_eq!(pool.in_flight(), 1);
        drop(lease);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.idle_count(&target().key()), 1);

        let _lease = pool.acquire(&target()).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1, "client should be reused");
    }

    #[tokio::test]
    async fn test_fail_fast_at_capacity() {
        let (pool, _) = pool_with(PoolConfig {
            max_clients: 1,
            mode: AcquireMode::FailFast,
            ..PoolConfig::default()
        });

        let _held = pool.acquire(&target()).await.unwrap();
        let result = pool.acquire(&target()).await;
        assert!(matches!(
            result,
            Err(PoolError::Exhausted { max_clients: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_times_out_at_capacity() {
        let (pool, _) = pool_with(PoolConfig {
            max_clients: 1,
            acquire_timeout: Duration::from_millis(50),
            mode: AcquireMode::Queue,
            ..PoolConfig::default()
        });

        let _held = pool.acquire(&target()).await.unwrap();
        let result = pool.acquire(&target()).await;
        assert!(matches!(result, Err(PoolError::Exhausted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_acquirer_gets_freed_lease() {
        let (pool, created) = pool_with(PoolConfig {
            max_clients: 1,
            acquire_timeout: Duration::from_secs(5),
            mode: AcquireMode::Queue,
            ..PoolConfig::default()
        });
        let pool = Arc::new(pool);

        let held = pool.acquire(&target()).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&target()).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        let lease = waiter.await.unwrap();
        assert!(lease.is_ok());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lease_count_never_exceeds_capacity() {
        let (pool, _) = pool_with(PoolConfig {
            max_clients: 2,
            acquire_timeout: Duration::from_secs(5),
            mode: AcquireMode::Queue,
            ..PoolConfig::default()
        });
        let pool = Arc::new(pool);
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _lease = pool.acquire(&target()).await.unwrap();
                peak.fetch_max(pool.in_flight(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_creation_failure_is_fatal_and_releases_capacity() {
        let mut registry = ClientRegistry::new();
        registry.register(Arc::new(FailingFactory));
        let pool = ClientPool::new(
            registry,
            PoolConfig {
                max_clients: 1,
                ..PoolConfig::default()
            },
        );

        let result = pool.acquire(&target()).await;
        assert!(matches!(
            result,
            Err(PoolError::Creation(ProviderError::Auth))
        ));
        // The failed acquire must not leak its capacity unit.
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_idle_ttl_eviction() {
        let (pool, created) = pool_with(PoolConfig {
            idle_ttl: Duration::from_millis(10),
            ..PoolConfig::default()
        });

        drop(pool.acquire(&target()).await.unwrap());
        assert_eq!(pool.idle_count(&target().key()), 1);

        std::thread::sleep(Duration::from_millis(20));
        pool.purge_idle();
        assert_eq!(pool.idle_count(&target().key()), 0);

        let _lease = pool.acquire(&target()).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2, "stale client replaced");
    }
}
