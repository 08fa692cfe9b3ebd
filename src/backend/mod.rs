//! Coordination backend adapters
//!
//! The coordination core only needs a consistent key-value store with
//! prefix reads, TTL leases renewed by heartbeat, and named locks bound to
//! a lease. [`CoordinationBackend`] is that boundary; the adapters are:
//!
//! - [`EtcdBackend`] - etcd v3 (KV, Lease and Lock services)
//! - [`MemoryBackend`] - in-process store for tests and single-node runs

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

#[cfg(feature = "etcd")]
pub use etcd::EtcdBackend;
pub use memory::{BackendOp, MemoryBackend};

use crate::common::{BackendKind, Config, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Backend-assigned lease identifier
pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// One page of a prefix scan, in ascending key order.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub kvs: Vec<KeyValue>,
    /// More keys remain after the last one in `kvs`
    pub more: bool,
}

/// Proof of a held lock, needed to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKey {
    pub name: String,
    pub lease: LeaseId,
    /// Backend-specific ownership token
    pub token: Vec<u8>,
}

#[async_trait]
pub trait CoordinationBackend: Send + Sync + 'static {
    /// Short label for logs
    fn kind(&self) -> &'static str;

    /// Write `key` bound to `lease`; the key disappears with the lease.
    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()>;

    /// Keys under `prefix` strictly after `after`, ascending, at most
    /// `limit` of them (0 = backend default). Callers drain `Page::more`.
    async fn get_prefix(&self, prefix: &str, after: Option<&str>, limit: u32) -> Result<Page>;

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Single keepalive round trip. Fails once the lease is gone.
    async fn lease_keep_alive_once(&self, lease: LeaseId) -> Result<()>;

    /// Revoke a lease, deleting its keys and releasing its locks.
    async fn lease_revoke(&self, lease: LeaseId) -> Result<()>;

    /// Block until the named lock is held on behalf of `lease`.
    async fn lock(&self, name: &str, lease: LeaseId) -> Result<LockKey>;

    async fn unlock(&self, key: &LockKey) -> Result<()>;

    /// Key of the lock `lease` would hold on `name`, derivable without a
    /// grant so a lost grant can still be released.
    fn lock_key(&self, name: &str, lease: LeaseId) -> LockKey;

    /// [`lock`](Self::lock) bounded by `timeout`; `Ok(None)` once it expires.
    ///
    /// A grant can land on the backend after the caller stopped waiting for
    /// it. On expiry the lock is released again on a best-effort basis, so it
    /// does not sit held until the lease dies.
    async fn try_lock(
        &self,
        name: &str,
        lease: LeaseId,
        timeout: Duration,
    ) -> Result<Option<LockKey>> {
        if let Ok(result) = tokio::time::timeout(timeout, self.lock(name, lease)).await {
            return result.map(Some);
        }

        let key = self.lock_key(name, lease);
        match tokio::time::timeout(timeout, self.unlock(&key)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(lock = %name, lease, "Failed to clear timed-out lock attempt: {}", e),
            Err(_) => tracing::warn!(lock = %name, lease, "Timed out clearing lock attempt"),
        }
        Ok(None)
    }
}

/// Build the backend selected in the configuration.
pub async fn connect(config: &Config) -> Result<Arc<dyn CoordinationBackend>> {
    match config.backend.kind {
        BackendKind::Memory => {
            tracing::warn!("Using in-memory coordination backend; ownership is process-local");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "etcd")]
        BackendKind::Etcd => {
            let backend =
                EtcdBackend::connect(&config.backend.endpoints, config.dial_timeout()).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "etcd"))]
        BackendKind::Etcd => Err(crate::Error::InvalidConfig(
            "etcd backend requested but the `etcd` feature is disabled".into(),
        )),
    }
}
