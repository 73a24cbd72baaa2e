//! Hands out backend handles according to the configured pooling policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::{BackendResult, HttpBackend, SnapshotStore};
use crate::config::{BackendConfig, PoolingPolicy};

type StoreFactory = dyn Fn() -> BackendResult<Arc<dyn SnapshotStore>> + Send + Sync;

/// Source of backend handles for accepted connections.
///
/// With [`PoolingPolicy::Shared`] every connection receives the same handle;
/// with [`PoolingPolicy::PerConnection`] each connection gets a freshly built
/// one. The shared handle always exists and is also used for outbox replay.
pub struct BackendPool {
    policy: PoolingPolicy,
    shared: Arc<dyn SnapshotStore>,
    factory: Box<StoreFactory>,
    issued: AtomicUsize,
    created: AtomicUsize,
}

impl BackendPool {
    /// Pool of reqwest clients for the given backend
    pub fn http(config: BackendConfig) -> BackendResult<Self> {
        let policy = config.pooling;
        Self::from_factory(policy, move || {
            Ok(Arc::new(HttpBackend::new(&config)?) as Arc<dyn SnapshotStore>)
        })
    }

    /// Pool built from an arbitrary store constructor
    pub fn from_factory<F>(policy: PoolingPolicy, factory: F) -> BackendResult<Self>
    where
        F: Fn() -> BackendResult<Arc<dyn SnapshotStore>> + Send + Sync + 'static,
    {
        let shared = factory()?;
        Ok(Self {
            policy,
            shared,
            factory: Box::new(factory),
            issued: AtomicUsize::new(0),
            created: AtomicUsize::new(1),
        })
    }

    /// Pool that always hands out the same store
    pub fn fixed(store: Arc<dyn SnapshotStore>) -> Self {
        let shared = store.clone();
        Self {
            policy: PoolingPolicy::Shared,
            shared,
            factory: Box::new(move || Ok(store.clone())),
            issued: AtomicUsize::new(0),
            created: AtomicUsize::new(1),
        }
    }

    /// Backend handle for a newly accepted connection
    pub fn connect(&self) -> BackendResult<Arc<dyn SnapshotStore>> {
        let handle = match self.policy {
            PoolingPolicy::Shared => self.shared.clone(),
            PoolingPolicy::PerConnection => {
                let handle = (self.factory)()?;
                self.created.fetch_add(1, Ordering::Relaxed);
                handle
            }
        };
        let issued = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(policy = ?self.policy, issued, "Backend handle issued");
        Ok(handle)
    }

    /// Handle not tied to any connection
    pub fn shared(&self) -> Arc<dyn SnapshotStore> {
        self.shared.clone()
    }

    pub fn policy(&self) -> PoolingPolicy {
        self.policy
    }

    /// Handles handed to connections so far
    pub fn handles_issued(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }

    /// Distinct backend clients constructed so far
    pub fn clients_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}
