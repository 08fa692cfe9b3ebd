//! Lease-scoped lock session
//!
//! All partition locks of a node are taken through one session, backed by
//! the node's lease. When the lease dies the backend releases every lock of
//! the session.

use crate::backend::{CoordinationBackend, LeaseId, LockKey};
use crate::common::{Error, Result};
use crate::common::utils::bounded;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct LockSession {
    backend: Arc<dyn CoordinationBackend>,
    lease: LeaseId,
    op_timeout: Duration,
    held: Mutex<HashMap<String, LockKey>>,
    closed: AtomicBool,
}

impl LockSession {
    pub fn new(backend: Arc<dyn CoordinationBackend>, lease: LeaseId, op_timeout: Duration) -> Self {
        Self {
            backend,
            lease,
            op_timeout,
            held: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Names of the locks this session believes it holds.
    pub fn held(&self) -> Vec<String> {
        let mut names: Vec<String> = self.held.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Block until `name` is held by this session.
    ///
    /// Unbounded on purpose: callers decide how long to wait on contention.
    pub async fn lock(&self, name: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::LeaseExpired(self.lease));
        }
        let key = self.backend.lock(name, self.lease).await?;
        self.held.lock().insert(name.to_string(), key);
        Ok(())
    }

    /// Take `name` if it frees up within `timeout`. `Ok(false)` means it is
    /// still held elsewhere; any grant that raced the deadline is released.
    pub async fn try_lock(&self, name: &str, timeout: Duration) -> Result<bool> {
        if self.is_closed() {
            return Err(Error::LeaseExpired(self.lease));
        }
        match self.backend.try_lock(name, self.lease, timeout).await? {
            Some(key) => {
                self.held.lock().insert(name.to_string(), key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release `name`. The local record is dropped even if the backend call
    /// fails; the lease bounds how long a stale remote lock can linger.
    pub async fn unlock(&self, name: &str) -> Result<()> {
        let key = self.held.lock().remove(name);
        let Some(key) = key else {
            return Ok(());
        };
        bounded("unlock", self.op_timeout, self.backend.unlock(&key)).await
    }

    /// Revoke the lease, releasing every lock and the registry entry.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let dropped = std::mem::take(&mut *self.held.lock());
        tracing::info!(
            lease = self.lease,
            locks = dropped.len(),
            "Closing lock session"
        );
        bounded(
            "lease revoke",
            self.op_timeout,
            self.backend.lease_revoke(self.lease),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test]
    async fn test_lock_unlock_close() {
        let backend = Arc::new(MemoryBackend::new());
        let lease = backend.lease_grant(Duration::from_secs(30)).await.unwrap();
        let session = LockSession::new(backend.clone(), lease, Duration::from_secs(1));

        session.lock("/p/0").await.unwrap();
        session.lock("/p/1").await.unwrap();
        assert_eq!(session.held(), vec!["/p/0", "/p/1"]);
        assert_eq!(backend.lock_holder("/p/0"), Some(lease));

        session.unlock("/p/0").await.unwrap();
        assert_eq!(backend.lock_holder("/p/0"), None);
        // unknown names are a no-op
        session.unlock("/p/9").await.unwrap();

        session.close().await.unwrap();
        assert!(session.is_closed());
        assert_eq!(backend.lock_holder("/p/1"), None);
        assert!(!backend.lease_alive(lease));
        assert!(matches!(
            session.lock("/p/0").await,
            Err(Error::LeaseExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_unlock_failure_still_forgets_lock() {
        let backend = Arc::new(MemoryBackend::new());
        let lease = backend.lease_grant(Duration::from_secs(30)).await.unwrap();
        let session = LockSession::new(backend.clone(), lease, Duration::from_secs(1));

        session.lock("/p/0").await.unwrap();
        backend.set_available(false);
        assert!(session.unlock("/p/0").await.is_err());
        assert!(session.held().is_empty());
    }
}
