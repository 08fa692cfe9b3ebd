//! Cluster inspection and assignment planning

use crate::backend::CoordinationBackend;
use crate::common::{format_partitions, Result};
use crate::coordinator::membership::MembershipRegistry;
use crate::coordinator::placement::{Assignment, PartitionAssigner};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Live members of a service and the assignment they converge to.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterReport {
    pub service_name: String,
    pub num_partitions: u32,
    pub peers: Vec<String>,
    /// Owner → partitions; members owning nothing are listed with none
    pub assignment: BTreeMap<String, Vec<u32>>,
}

impl ClusterReport {
    fn from_assignment(
        service_name: &str,
        peers: Vec<String>,
        assignment: &Assignment,
    ) -> Self {
        let mut by_member: BTreeMap<String, Vec<u32>> =
            peers.iter().map(|p| (p.clone(), Vec::new())).collect();
        for (member, partitions) in assignment.by_member() {
            by_member.insert(member.to_string(), partitions);
        }
        Self {
            service_name: service_name.to_string(),
            num_partitions: assignment.num_partitions(),
            peers,
            assignment: by_member,
        }
    }
}

impl fmt::Display for ClusterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "service {}: {} peers, {} partitions",
            self.service_name,
            self.peers.len(),
            self.num_partitions
        )?;
        for (member, partitions) in &self.assignment {
            let set: BTreeSet<u32> = partitions.iter().copied().collect();
            writeln!(
                f,
                "  {:<24} {:>4}  {}",
                member,
                partitions.len(),
                format_partitions(&set)
            )?;
        }
        Ok(())
    }
}

/// A partition that changes owner between two peer sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Move {
    pub partition: u32,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// Read the live peer set and compute the resulting assignment.
pub async fn inspect_cluster(
    backend: Arc<dyn CoordinationBackend>,
    service_name: &str,
    assigner: PartitionAssigner,
    op_timeout: Duration,
) -> Result<ClusterReport> {
    let registry = MembershipRegistry::new(backend, service_name, op_timeout);
    let peers = registry.list_peers().await?;
    tracing::debug!(service = service_name, peers = peers.len(), "Inspecting cluster");
    let assignment = assigner.assign(&peers);
    Ok(ClusterReport::from_assignment(service_name, peers, &assignment))
}

/// Assignment for a hypothetical peer set, without touching any backend.
pub fn plan_assignment(
    service_name: &str,
    peers: &[String],
    assigner: PartitionAssigner,
) -> ClusterReport {
    let assignment = assigner.assign(peers);
    ClusterReport::from_assignment(service_name, peers.to_vec(), &assignment)
}

/// Partitions whose owner differs between `before` and `after`.
pub fn plan_moves(before: &[String], after: &[String], assigner: PartitionAssigner) -> Vec<Move> {
    let old = assigner.assign(before);
    let new = assigner.assign(after);
    (0..assigner.num_partitions())
        .filter_map(|partition| {
            let from = old.owner(partition);
            let to = new.owner(partition);
            (from != to).then(|| Move {
                partition,
                from: from.map(str::to_string),
                to: to.map(str::to_string),
            })
        })
        .collect()
}
