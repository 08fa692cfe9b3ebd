//! Published view of the partitions this node owns
//!
//! The reconciler is the only writer. Everyone else (request routing, the
//! status API) reads immutable snapshots through an [`OwnershipView`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OwnershipSnapshot {
    /// Partitions whose lock this node holds
    pub owned: BTreeSet<u32>,
    /// Peer set seen by the last successful reconciliation
    pub peers: Vec<String>,
    /// Completed reconciliation ticks in the current session
    pub ticks: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Write side; owned by the coordinator and handed to the reconciler.
#[derive(Clone)]
pub struct OwnershipTable {
    tx: Arc<watch::Sender<OwnershipSnapshot>>,
}

impl OwnershipTable {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(OwnershipSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, snapshot: OwnershipSnapshot) {
        self.tx.send_replace(snapshot);
    }

    /// Drop all ownership, e.g. once the session is gone.
    pub fn clear(&self) {
        self.publish(OwnershipSnapshot {
            updated_at: Some(Utc::now()),
            ..Default::default()
        });
    }

    pub fn view(&self) -> OwnershipView {
        OwnershipView {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for OwnershipTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side; cheap to clone.
#[derive(Clone)]
pub struct OwnershipView {
    rx: watch::Receiver<OwnershipSnapshot>,
}

impl OwnershipView {
    pub fn snapshot(&self) -> OwnershipSnapshot {
        self.rx.borrow().clone()
    }

    pub fn owned_partitions(&self) -> BTreeSet<u32> {
        self.rx.borrow().owned.clone()
    }

    pub fn owns(&self, partition: u32) -> bool {
        self.rx.borrow().owned.contains(&partition)
    }

    /// Wait for the next published snapshot.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
