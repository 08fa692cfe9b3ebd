//! Reference-counted distributed lock for one partition
//!
//! Local callers share a single remote lock: only the 0 → 1 transition takes
//! it and only the 1 → 0 transition gives it back. Count changes and the
//! remote calls happen under one async mutex, so they are atomic relative to
//! each other.

use crate::common::{Error, Result};
use crate::coordinator::session::LockSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Default bound for [`PartitionLock::try_acquire`]
pub const DEFAULT_TRY_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

pub fn partition_lock_name(service_name: &str, partition: u32) -> String {
    format!("/services/{}/partitions/{}", service_name, partition)
}

pub struct PartitionLock {
    session: Arc<LockSession>,
    partition: u32,
    name: String,
    try_timeout: Duration,
    count: Mutex<usize>,
}

impl PartitionLock {
    pub fn new(session: Arc<LockSession>, service_name: &str, partition: u32) -> Self {
        Self {
            session,
            partition,
            name: partition_lock_name(service_name, partition),
            try_timeout: DEFAULT_TRY_ACQUIRE_TIMEOUT,
            count: Mutex::new(0),
        }
    }

    pub fn with_try_timeout(mut self, timeout: Duration) -> Self {
        self.try_timeout = timeout;
        self
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local reference count
    pub async fn count(&self) -> usize {
        *self.count.lock().await
    }

    /// Take a reference, acquiring the remote lock if none is held.
    ///
    /// May block for as long as another session holds the lock. A failed
    /// remote call leaves the count unchanged.
    pub async fn acquire(&self) -> Result<()> {
        let mut count = self.count.lock().await;
        if *count == 0 {
            self.session.lock(&self.name).await?;
            tracing::debug!(partition = self.partition, lock = %self.name, "Acquired partition lock");
        }
        *count += 1;
        Ok(())
    }

    /// [`acquire`](Self::acquire) bounded by the try timeout; expiry surfaces
    /// as `LockUnavailable` and leaves no remote lock behind.
    pub async fn try_acquire(&self) -> Result<()> {
        let unavailable = || {
            Error::lock_unavailable(
                &self.name,
                format!("not acquired within {:?}", self.try_timeout),
            )
        };
        let mut count = tokio::time::timeout(self.try_timeout, self.count.lock())
            .await
            .map_err(|_| unavailable())?;
        if *count == 0 {
            if !self.session.try_lock(&self.name, self.try_timeout).await? {
                return Err(unavailable());
            }
            tracing::debug!(partition = self.partition, lock = %self.name, "Acquired partition lock");
        }
        *count += 1;
        Ok(())
    }

    /// Drop a reference, releasing the remote lock on the last one.
    ///
    /// On a failed remote unlock the local count is still 0; the error is
    /// returned so callers can log it.
    pub async fn release(&self) -> Result<()> {
        let mut count = self.count.lock().await;
        if *count == 0 {
            return Err(Error::InvalidRelease(self.name.clone()));
        }
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }

        match self.session.unlock(&self.name).await {
            Ok(()) => {
                tracing::debug!(partition = self.partition, lock = %self.name, "Released partition lock");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    partition = self.partition,
                    lock = %self.name,
                    "Remote unlock failed, treating lock as released: {}",
                    e
                );
                Err(Error::BackendUnavailable(format!(
                    "unlock {}: {}",
                    self.name, e
                )))
            }
        }
    }
}
