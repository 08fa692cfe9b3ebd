//! Partition reconciler
//!
//! Each tick drives local ownership toward the current assignment:
//!
//! 1. list live peers (skip the tick if the backend is unreachable)
//! 2. compute the assignment and this node's desired partitions
//! 3. try to lock every desired partition not yet owned
//! 4. release every owned partition that is no longer desired
//!
//! A contended lock is not an error: the previous owner is still draining
//! and the partition is retried on the next tick. The first contended
//! attempt of a tick is followed by a ping, since a hung backend also looks
//! like contention; a failed ping ends the tick as an outage.
//!
//! Cancellation ends a tick between or during lock attempts. Interrupted
//! attempts are not cleaned up individually: the session's lease is revoked
//! right after.

use crate::common::{format_partitions, Error, Result};
use crate::coordinator::membership::MembershipRegistry;
use crate::coordinator::ownership::{OwnershipSnapshot, OwnershipTable};
use crate::coordinator::placement::PartitionAssigner;
use crate::coordinator::semaphore::PartitionLock;
use crate::coordinator::session::LockSession;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What a single tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub peers: Vec<String>,
    pub desired: BTreeSet<u32>,
    pub acquired: Vec<u32>,
    pub contended: Vec<u32>,
    pub released: Vec<u32>,
    /// Set when the tick stopped early because the backend was unreachable
    pub skipped: Option<String>,
    /// The tick was cut short by cancellation
    pub cancelled: bool,
}

impl TickReport {
    pub fn changed(&self) -> bool {
        !self.acquired.is_empty() || !self.released.is_empty()
    }
}

pub struct Reconciler {
    registry: MembershipRegistry,
    assigner: PartitionAssigner,
    session: Arc<LockSession>,
    ownership: OwnershipTable,
    service_name: String,
    self_address: String,
    interval: Duration,
    lock_timeout: Duration,
    owned: BTreeMap<u32, PartitionLock>,
    last_peers: Vec<String>,
    ticks: u64,
}

impl Reconciler {
    pub fn new(
        registry: MembershipRegistry,
        assigner: PartitionAssigner,
        session: Arc<LockSession>,
        ownership: OwnershipTable,
        self_address: impl Into<String>,
    ) -> Self {
        let service_name = registry.service_name().to_string();
        Self {
            registry,
            assigner,
            session,
            ownership,
            service_name,
            self_address: self_address.into(),
            interval: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(1),
            owned: BTreeMap::new(),
            last_peers: Vec::new(),
            ticks: 0,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Bound on each partition lock attempt
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn owned_partitions(&self) -> BTreeSet<u32> {
        self.owned.keys().copied().collect()
    }

    pub fn last_peers(&self) -> &[String] {
        &self.last_peers
    }

    /// Run one reconciliation pass, stopping early once `cancel` fires.
    ///
    /// Backend outages end the tick early and are reported, not returned.
    /// Errors are reserved for states the node cannot recover from: a closed
    /// session or a broken release invariant.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> Result<TickReport> {
        let mut report = TickReport::default();

        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            listed = self.registry.list_peers() => Some(listed),
        };
        let Some(listed) = listed else {
            report.cancelled = true;
            return Ok(report);
        };
        let peers = match listed {
            Ok(peers) => peers,
            Err(e) if e.is_retryable() => {
                tracing::warn!(service = %self.service_name, "Skipping reconciliation, cannot list peers: {}", e);
                report.skipped = Some(e.to_string());
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        let desired = self.assigner.assign(&peers).partitions_for(&self.self_address);
        if desired.is_empty() && !peers.iter().any(|p| p == &self.self_address) {
            tracing::debug!(
                address = %self.self_address,
                "Not in the peer set, releasing all partitions"
            );
        }
        self.last_peers = peers.clone();
        report.peers = peers;
        report.desired = desired.clone();

        // acquire before release
        let missing: Vec<u32> = desired
            .iter()
            .copied()
            .filter(|p| !self.owned.contains_key(p))
            .collect();
        let mut pinged = false;
        for partition in missing {
            let lock = PartitionLock::new(self.session.clone(), &self.service_name, partition)
                .with_try_timeout(self.lock_timeout);
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                attempt = lock.try_acquire() => Some(attempt),
            };
            let Some(attempt) = attempt else {
                tracing::debug!(partition, "Reconciliation cancelled while acquiring");
                report.cancelled = true;
                self.publish(&report);
                return Ok(report);
            };
            match attempt {
                Ok(()) => {
                    self.owned.insert(partition, lock);
                    report.acquired.push(partition);
                }
                Err(Error::LockUnavailable { .. }) => {
                    tracing::debug!(partition, "Partition still held elsewhere, retrying next tick");
                    report.contended.push(partition);
                    if pinged {
                        continue;
                    }
                    pinged = true;
                    if let Err(e) = self.registry.ping().await {
                        tracing::warn!(partition, "Backend not answering, ending tick: {}", e);
                        report.skipped = Some(e.to_string());
                        self.publish(&report);
                        return Ok(report);
                    }
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(partition, "Backend unavailable while acquiring, ending tick: {}", e);
                    report.skipped = Some(e.to_string());
                    self.publish(&report);
                    return Ok(report);
                }
                Err(e) => return Err(e),
            }
        }

        if cancel.is_cancelled() {
            report.cancelled = true;
            self.publish(&report);
            return Ok(report);
        }

        let stale: Vec<u32> = self
            .owned
            .keys()
            .copied()
            .filter(|p| !desired.contains(p))
            .collect();
        for partition in stale {
            let Some(lock) = self.owned.remove(&partition) else {
                continue;
            };
            match lock.release().await {
                Ok(()) => {}
                Err(e @ Error::InvalidRelease(_)) => return Err(e),
                // the local count is already 0; the lease bounds the stale remote lock
                Err(e) => tracing::warn!(partition, "Released partition with errors: {}", e),
            }
            report.released.push(partition);
        }

        self.publish(&report);
        Ok(report)
    }

    fn publish(&mut self, report: &TickReport) {
        self.ticks += 1;
        let owned = self.owned_partitions();
        if report.changed() {
            tracing::info!(
                service = %self.service_name,
                peers = self.last_peers.len(),
                acquired = %format_partitions(&report.acquired.iter().copied().collect::<BTreeSet<_>>()),
                released = %format_partitions(&report.released.iter().copied().collect::<BTreeSet<_>>()),
                "Ownership changed, now owning {}",
                format_partitions(&owned)
            );
        }
        self.ownership.publish(OwnershipSnapshot {
            owned,
            peers: self.last_peers.clone(),
            ticks: self.ticks,
            updated_at: Some(Utc::now()),
        });
    }

    /// Forget every partition without touching the backend. Used once the
    /// session is gone, since the backend already dropped the locks.
    fn abandon(&mut self) {
        if !self.owned.is_empty() {
            tracing::info!(
                partitions = %format_partitions(&self.owned_partitions()),
                "Abandoning partition ownership"
            );
        }
        self.owned.clear();
        self.ownership.clear();
    }

    /// Reconcile on every interval until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            service = %self.service_name,
            address = %self.self_address,
            "Reconciler started (every {:?})",
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick(&cancel).await {
                tracing::error!("Reconciliation failed: {}", e);
                break Err(e);
            }
        };

        self.abandon();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendOp, CoordinationBackend, MemoryBackend};
    use crate::coordinator::membership::Member;
    use crate::coordinator::semaphore::partition_lock_name;

    const A: &str = "10.0.0.1:8177";
    const B: &str = "10.0.0.2:8177";

    struct Node {
        reconciler: Reconciler,
        session: Arc<LockSession>,
        ownership: OwnershipTable,
    }

    async fn node(backend: &Arc<MemoryBackend>, address: &str, num_partitions: u32) -> Node {
        let lease = backend.lease_grant(Duration::from_secs(30)).await.unwrap();
        let registry = MembershipRegistry::new(backend.clone(), "orders", Duration::from_secs(1));
        registry
            .register(&Member {
                service_name: "orders".into(),
                member_id: address.into(),
                address: address.into(),
                lease,
            })
            .await
            .unwrap();
        let session = Arc::new(LockSession::new(backend.clone(), lease, Duration::from_secs(1)));
        let ownership = OwnershipTable::new();
        let reconciler = Reconciler::new(
            registry,
            PartitionAssigner::new(num_partitions, 160),
            session.clone(),
            ownership.clone(),
            address,
        )
        .with_lock_timeout(Duration::from_millis(50));
        Node {
            reconciler,
            session,
            ownership,
        }
    }

    /// Lock every partition under a lease that never lets go.
    async fn hold_all(backend: &MemoryBackend, num_partitions: u32) {
        let other = backend.lease_grant(Duration::from_secs(300)).await.unwrap();
        for p in 0..num_partitions {
            backend
                .lock(&partition_lock_name("orders", p), other)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_single_node_takes_everything() {
        let backend = Arc::new(MemoryBackend::new());
        let cancel = CancellationToken::new();
        let mut a = node(&backend, A, 4).await;

        let report = a.reconciler.tick(&cancel).await.unwrap();
        assert_eq!(report.peers, vec![A]);
        assert_eq!(report.acquired, vec![0, 1, 2, 3]);
        assert!(report.skipped.is_none());

        let view = a.ownership.view();
        assert_eq!(view.owned_partitions(), BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(view.snapshot().ticks, 1);

        // steady state: nothing to do
        let report = a.reconciler.tick(&cancel).await.unwrap();
        assert!(!report.changed());
    }

    #[tokio::test]
    async fn test_contended_partition_is_retried() {
        let backend = Arc::new(MemoryBackend::new());
        let cancel = CancellationToken::new();
        let mut a = node(&backend, A, 4).await;
        a.reconciler.tick(&cancel).await.unwrap();

        let mut b = node(&backend, B, 4).await;
        let b_wants = PartitionAssigner::new(4, 160)
            .assign(&[A, B])
            .partitions_for(B);

        // A has not observed B yet, so B's share is contended
        let report = b.reconciler.tick(&cancel).await.unwrap();
        assert!(report.acquired.is_empty());
        assert_eq!(report.contended, b_wants.iter().copied().collect::<Vec<_>>());

        // A hands off, B picks up
        let report = a.reconciler.tick(&cancel).await.unwrap();
        assert_eq!(report.released, b_wants.iter().copied().collect::<Vec<_>>());
        let report = b.reconciler.tick(&cancel).await.unwrap();
        assert_eq!(report.acquired, b_wants.iter().copied().collect::<Vec<_>>());

        for p in 0..4 {
            assert_eq!(backend.max_concurrent_holders(&partition_lock_name("orders", p)), 1);
        }
        let a_owned = a.ownership.view().owned_partitions();
        let b_owned = b.ownership.view().owned_partitions();
        assert!(a_owned.is_disjoint(&b_owned));
        assert_eq!(a_owned.len() + b_owned.len(), 4);
    }

    #[tokio::test]
    async fn test_outage_skips_tick_without_releasing() {
        let backend = Arc::new(MemoryBackend::new());
        let cancel = CancellationToken::new();
        let mut a = node(&backend, A, 4).await;
        a.reconciler.tick(&cancel).await.unwrap();
        let ops_before = backend.ops().len();

        backend.set_available(false);
        let report = a.reconciler.tick(&cancel).await.unwrap();
        assert!(report.skipped.is_some());
        assert_eq!(a.reconciler.owned_partitions().len(), 4);

        backend.set_available(true);
        let unlocks = backend.ops()[ops_before..]
            .iter()
            .filter(|op| matches!(op, BackendOp::Unlock { .. }))
            .count();
        assert_eq!(unlocks, 0);
    }

    #[tokio::test]
    async fn test_missing_self_releases_everything() {
        let backend = Arc::new(MemoryBackend::new());
        let cancel = CancellationToken::new();
        let mut a = node(&backend, A, 4).await;
        a.reconciler.tick(&cancel).await.unwrap();

        // only a foreign peer remains registered
        let other = backend.lease_grant(Duration::from_secs(30)).await.unwrap();
        backend.expire_lease(a.session.lease());
        backend
            .put("/services/orders/members/b", B, other)
            .await
            .unwrap();

        // the session lease is gone, so the backend already dropped the locks;
        // the reconciler still has to stop claiming them
        let report = a.reconciler.tick(&cancel).await.unwrap();
        assert!(report.desired.is_empty());
        assert_eq!(report.released, vec![0, 1, 2, 3]);
        assert!(a.ownership.view().owned_partitions().is_empty());
    }

    #[tokio::test]
    async fn test_closed_session_is_fatal() {
        let backend = Arc::new(MemoryBackend::new());
        let cancel = CancellationToken::new();
        let mut a = node(&backend, A, 4).await;
        let registry = MembershipRegistry::new(backend.clone(), "orders", Duration::from_secs(1));
        let other = backend.lease_grant(Duration::from_secs(30)).await.unwrap();
        registry
            .register(&Member {
                service_name: "orders".into(),
                member_id: "a".into(),
                address: A.into(),
                lease: other,
            })
            .await
            .unwrap();

        a.session.close().await.unwrap();
        let err = a.reconciler.tick(&cancel).await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel_and_clears_ownership() {
        let backend = Arc::new(MemoryBackend::new());
        let a = node(&backend, A, 4).await;
        let view = a.ownership.view();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            a.reconciler
                .with_interval(Duration::from_millis(10))
                .run(cancel.clone()),
        );

        let mut changes = view.clone();
        while changes.owned_partitions().len() < 4 {
            assert!(changes.changed().await);
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(view.owned_partitions().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_tick_takes_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let mut a = node(&backend, A, 4).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = a.reconciler.tick(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert!(report.acquired.is_empty());
        assert!(a.session.held().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_contended_tick() {
        let backend = Arc::new(MemoryBackend::new());
        let a = node(&backend, A, 32).await;
        hold_all(&backend, 32).await;
        let lease = a.session.lease();
        let view = a.ownership.view();

        // every attempt would wait out the full second
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        let task = tokio::spawn(
            a.reconciler
                .with_lock_timeout(Duration::from_secs(1))
                .run(cancel.clone()),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(view.owned_partitions().is_empty());
        for p in 0..32 {
            assert_ne!(
                backend.lock_holder(&partition_lock_name("orders", p)),
                Some(lease)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_backend_ends_tick() {
        let backend = Arc::new(MemoryBackend::new());
        let cancel = CancellationToken::new();
        let a = node(&backend, A, 4).await;
        hold_all(&backend, 4).await;
        let mut reconciler = a.reconciler.with_lock_timeout(Duration::from_secs(1));

        let start = tokio::time::Instant::now();
        let tick = tokio::spawn(async move { reconciler.tick(&cancel).await });

        // peers are listed and the first lock attempt is waiting
        tokio::time::sleep(Duration::from_millis(10)).await;
        backend.set_stalled(true);

        let report = tick.await.unwrap().unwrap();
        assert!(report.skipped.is_some());
        assert_eq!(report.contended, vec![0]);
        assert!(report.acquired.is_empty());
        // one attempt and one ping, not a timeout per partition
        assert!(start.elapsed() < Duration::from_secs(4));
        backend.set_stalled(false);
    }
}
