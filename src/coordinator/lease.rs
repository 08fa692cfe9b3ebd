//! Lease keeper
//!
//! Renews the node's lease on a fixed interval shorter than its TTL. Losing
//! the lease means the node can no longer trust any lock it holds, so the
//! first failed keepalive ends the task with `LeaseExpired`.

use crate::backend::{CoordinationBackend, LeaseId};
use crate::common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct LeaseKeeper {
    backend: Arc<dyn CoordinationBackend>,
    lease: LeaseId,
    interval: Duration,
}

impl LeaseKeeper {
    pub fn new(backend: Arc<dyn CoordinationBackend>, lease: LeaseId, interval: Duration) -> Self {
        Self {
            backend,
            lease,
            interval,
        }
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    /// One keepalive, bounded by the heartbeat interval.
    pub async fn keep_alive(&self) -> Result<()> {
        let renewal = self.backend.lease_keep_alive_once(self.lease);
        match tokio::time::timeout(self.interval, renewal).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!(lease = self.lease, "Lease keepalive failed: {}", e);
                Err(Error::LeaseExpired(self.lease))
            }
            Err(_) => {
                tracing::error!(
                    lease = self.lease,
                    "Lease keepalive timed out after {:?}",
                    self.interval
                );
                Err(Error::LeaseExpired(self.lease))
            }
        }
    }

    /// Heartbeat until cancelled or the lease is lost.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            lease = self.lease,
            "Lease keeper started (every {:?})",
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the lease was just granted
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(lease = self.lease, "Lease keeper stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            self.keep_alive().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test(start_paused = true)]
    async fn test_keeper_holds_lease_past_ttl() {
        let backend = Arc::new(MemoryBackend::new());
        let lease = backend.lease_grant(Duration::from_secs(2)).await.unwrap();
        let keeper = LeaseKeeper::new(backend.clone(), lease, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(keeper.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(backend.lease_alive(lease));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeper_fails_when_lease_lost() {
        let backend = Arc::new(MemoryBackend::new());
        let lease = backend.lease_grant(Duration::from_secs(2)).await.unwrap();
        let keeper = LeaseKeeper::new(backend.clone(), lease, Duration::from_secs(1));
        let task = tokio::spawn(keeper.run(CancellationToken::new()));

        backend.expire_lease(lease);
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::LeaseExpired(l) if l == lease));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeper_fails_when_backend_down() {
        let backend = Arc::new(MemoryBackend::new());
        let lease = backend.lease_grant(Duration::from_secs(2)).await.unwrap();
        let keeper = LeaseKeeper::new(backend.clone(), lease, Duration::from_secs(1));

        backend.set_available(false);
        assert!(keeper.keep_alive().await.unwrap_err().is_terminal());
    }
}
