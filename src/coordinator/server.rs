//! Coordinator node
//!
//! Wires one node together: lease, session, registration, then the
//! supervised group of keeper, reconciler and any attached services.

use crate::backend::CoordinationBackend;
use crate::common::utils::bounded;
use crate::common::{format_partitions, Config, Error, Result};
use crate::coordinator::lease::LeaseKeeper;
use crate::coordinator::membership::{Member, MembershipRegistry};
use crate::coordinator::ownership::{OwnershipTable, OwnershipView};
use crate::coordinator::placement::PartitionAssigner;
use crate::coordinator::reconciler::Reconciler;
use crate::coordinator::session::LockSession;
use crate::coordinator::supervisor::Supervisor;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A long-running task that lives and dies with the node's session.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run until `cancel` fires. Returning an error stops the node.
    async fn serve(self: Arc<Self>, cancel: CancellationToken) -> Result<()>;
}

pub struct Coordinator {
    config: Config,
    backend: Arc<dyn CoordinationBackend>,
    ownership: OwnershipTable,
    services: Vec<Arc<dyn Service>>,
}

impl Coordinator {
    pub fn new(config: Config, backend: Arc<dyn CoordinationBackend>) -> Self {
        Self {
            config,
            backend,
            ownership: OwnershipTable::new(),
            services: Vec::new(),
        }
    }

    /// Services run alongside the keeper and reconciler in every session.
    pub fn with_services(mut self, services: Vec<Arc<dyn Service>>) -> Self {
        self.services = services;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ownership(&self) -> OwnershipView {
        self.ownership.view()
    }

    /// Partitions this node currently owns.
    pub fn owned_partitions(&self) -> BTreeSet<u32> {
        self.ownership.view().owned_partitions()
    }

    /// Register and run one session until `cancel` fires or a task fails.
    ///
    /// Failing to obtain a lease or to register is returned immediately.
    /// Whatever ends the session, ownership is cleared and the lease is
    /// revoked before returning.
    pub async fn register_and_run(&self, cancel: CancellationToken) -> Result<()> {
        let config = &self.config;
        tracing::info!("Starting node: {}", config.member_id());
        tracing::info!("  Service: {}", config.service_name);
        tracing::info!("  Address: {}", config.node_address);
        tracing::info!("  Backend: {}", self.backend.kind());
        tracing::info!("  Partitions: {}", config.num_partitions);
        tracing::info!("  Lease TTL: {:?}", config.lease_ttl());

        let lease = bounded(
            "lease grant",
            config.op_timeout(),
            self.backend.lease_grant(config.lease_ttl()),
        )
        .await?;
        let session = Arc::new(LockSession::new(
            self.backend.clone(),
            lease,
            config.op_timeout(),
        ));

        let registry = MembershipRegistry::new(
            self.backend.clone(),
            config.service_name.clone(),
            config.op_timeout(),
        )
        .with_page_limit(config.page_limit);
        let member = Member {
            service_name: config.service_name.clone(),
            member_id: config.member_id().to_string(),
            address: config.node_address.clone(),
            lease,
        };
        if let Err(e) = registry.register(&member).await {
            self.close_session(&session).await;
            return Err(e);
        }

        let mut group = Supervisor::new(&cancel);

        let keeper = LeaseKeeper::new(self.backend.clone(), lease, config.keepalive_interval());
        group.spawn("lease-keeper", keeper.run(group.token()));

        let reconciler = Reconciler::new(
            registry,
            PartitionAssigner::new(config.num_partitions, config.virtual_nodes),
            session.clone(),
            self.ownership.clone(),
            config.node_address.clone(),
        )
        .with_interval(config.reconcile_interval())
        .with_lock_timeout(config.lock_timeout());
        group.spawn("reconciler", reconciler.run(group.token()));

        for service in &self.services {
            let name = service.name().to_string();
            group.spawn(name, service.clone().serve(group.token()));
        }

        tracing::info!(lease, tasks = group.len(), "✓ Node ready");
        let result = group.wait().await;

        let owned = self.owned_partitions();
        self.ownership.clear();
        self.close_session(&session).await;
        match &result {
            Ok(()) => tracing::info!("Node stopped"),
            Err(e) => tracing::error!(
                "Node session ended: {} (dropped partitions: {})",
                e,
                format_partitions(&owned)
            ),
        }
        result
    }

    /// Run sessions until cancelled. With `rejoin_on_lease_loss` set, a lost
    /// lease starts a fresh session instead of stopping the node.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = Duration::from_millis(100);
        loop {
            match self.register_and_run(cancel.clone()).await {
                Err(e) if e.is_terminal() && self.config.rejoin_on_lease_loss => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    tracing::warn!("Lease lost, rejoining in {:?}", backoff);
                }
                Err(e @ Error::BackendUnavailable(_)) if self.config.rejoin_on_lease_loss => {
                    tracing::warn!("Cannot start session ({}), retrying in {:?}", e, backoff);
                }
                other => return other,
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.config.lease_ttl());
        }
    }

    async fn close_session(&self, session: &LockSession) {
        if let Err(e) = session.close().await {
            // the lease runs out on its own
            tracing::warn!(lease = session.lease(), "Failed to revoke lease: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::common::{BackendConfig, BackendKind};

    fn config(address: &str) -> Config {
        Config {
            service_name: "orders".into(),
            node_address: address.into(),
            num_partitions: 4,
            backend: BackendConfig {
                kind: BackendKind::Memory,
                ..Default::default()
            },
            reconcile_interval_ms: 20,
            lock_timeout_ms: 50,
            ..Default::default()
        }
    }

    struct Failing;

    #[async_trait]
    impl Service for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn serve(self: Arc<Self>, _cancel: CancellationToken) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(Error::Internal("service crashed".into()))
        }
    }

    #[tokio::test]
    async fn test_register_failure_is_fatal() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_available(false);
        let node = Coordinator::new(config("10.0.0.1:8177"), backend);

        let err = node
            .register_and_run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_service_failure_ends_session() {
        let backend = Arc::new(MemoryBackend::new());
        let node = Coordinator::new(config("10.0.0.1:8177"), backend.clone())
            .with_services(vec![Arc::new(Failing)]);

        let err = node
            .register_and_run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(node.owned_partitions().is_empty());
        assert!(backend.max_concurrent_holders_any() <= 1);
        for p in 0..4 {
            let name = crate::coordinator::semaphore::partition_lock_name("orders", p);
            assert_eq!(backend.lock_holder(&name), None);
        }
    }

    #[tokio::test]
    async fn test_cancel_releases_everything() {
        let backend = Arc::new(MemoryBackend::new());
        let node = Arc::new(Coordinator::new(config("10.0.0.1:8177"), backend.clone()));
        let cancel = CancellationToken::new();

        let mut view = node.ownership();
        let task = tokio::spawn({
            let node = node.clone();
            let cancel = cancel.clone();
            async move { node.serve(cancel).await }
        });
        while view.owned_partitions().len() < 4 {
            assert!(view.changed().await);
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(node.owned_partitions().is_empty());
        for p in 0..4 {
            let name = crate::coordinator::semaphore::partition_lock_name("orders", p);
            assert_eq!(backend.lock_holder(&name), None);
        }
    }
}
