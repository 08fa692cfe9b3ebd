//! Partition placement using a consistent hash ring
//!
//! Every node computes the assignment independently from the same peer
//! snapshot, so no coordination is needed to agree on it. The ring (rather
//! than `hash % members`) keeps membership changes local: only partitions
//! whose nearest virtual node belonged to the joining or leaving member move.

use crate::common::ConsistentHashRing;
use std::collections::{BTreeMap, BTreeSet};

/// Ring points per member unless configured otherwise
pub const DEFAULT_VIRTUAL_NODES: u32 = 160;

/// Partition → owner mapping for one peer snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    num_partitions: u32,
    /// Indexed by partition; empty when there are no members
    owners: Vec<String>,
}

impl Assignment {
    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn owner(&self, partition: u32) -> Option<&str> {
        self.owners.get(partition as usize).map(String::as_str)
    }

    /// Partitions owned by `member`
    pub fn partitions_for(&self, member: &str) -> BTreeSet<u32> {
        self.iter()
            .filter(|(_, owner)| *owner == member)
            .map(|(partition, _)| partition)
            .collect()
    }

    /// Partitions grouped by owner
    pub fn by_member(&self) -> BTreeMap<&str, Vec<u32>> {
        let mut buckets: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
        for (partition, owner) in self.iter() {
            buckets.entry(owner).or_default().push(partition);
        }
        buckets
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        (0u32..).zip(self.owners.iter().map(String::as_str))
    }
}

/// Stateless assigner for a fixed partition count.
#[derive(Debug, Clone, Copy)]
pub struct PartitionAssigner {
    num_partitions: u32,
    virtual_nodes: u32,
}

impl PartitionAssigner {
    pub fn new(num_partitions: u32, virtual_nodes: u32) -> Self {
        Self {
            num_partitions,
            virtual_nodes: virtual_nodes.max(1),
        }
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    /// Assign every partition to one of `peers`.
    ///
    /// Peer order and duplicates do not change the result.
    pub fn assign<S: AsRef<str>>(&self, peers: &[S]) -> Assignment {
        let ring = ConsistentHashRing::new(peers, self.virtual_nodes);

        let owners = if ring.is_empty() {
            Vec::new()
        } else {
            (0..self.num_partitions)
                .filter_map(|partition| ring.owner(partition).map(str::to_string))
                .collect()
        };

        Assignment {
            num_partitions: self.num_partitions,
            owners,
        }
    }
}

/// Assign with the default number of virtual nodes.
pub fn assign<S: AsRef<str>>(peers: &[S], num_partitions: u32) -> Assignment {
    PartitionAssigner::new(num_partitions, DEFAULT_VIRTUAL_NODES).assign(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("10.0.0.{}:8177", i)).collect()
    }

    #[test]
    fn test_assignment_total_and_deterministic() {
        for size in 1..=10 {
            let members = peers(size);
            for num_partitions in [1, 4, 16, 100] {
                let first = assign(&members, num_partitions);
                let second = assign(&members, num_partitions);
                assert_eq!(first, second);

                for partition in 0..num_partitions {
                    let owner = first.owner(partition).unwrap();
                    assert!(members.iter().any(|m| m == owner));
                }
                assert_eq!(first.owner(num_partitions), None);

                let counted: usize = first.by_member().values().map(Vec::len).sum();
                assert_eq!(counted, num_partitions as usize);
            }
        }
    }

    #[test]
    fn test_assignment_ignores_peer_order() {
        let mut members = peers(5);
        let forward = assign(&members, 64);
        members.reverse();
        members.push(members[0].clone());
        assert_eq!(forward, assign(&members, 64));
    }

    #[test]
    fn test_locality_on_member_removal() {
        let a = "10.0.0.1:8177";
        let b = "10.0.0.2:8177";
        let c = "10.0.0.3:8177";

        let before = assign(&[a, b, c], 12);
        let after = assign(&[a, b], 12);

        for partition in 0..12 {
            let old = before.owner(partition).unwrap();
            let new = after.owner(partition).unwrap();
            if old != c {
                assert_eq!(old, new, "partition {} moved off a surviving member", partition);
            }
            assert_ne!(new, c);
        }
    }

    #[test]
    fn test_locality_on_member_join() {
        let members = peers(4);
        let before = assign(&members[..3], 100);
        let after = assign(&members, 100);
        let joined = members[3].as_str();

        for partition in 0..100 {
            let new = after.owner(partition).unwrap();
            if new != joined {
                assert_eq!(before.owner(partition), Some(new));
            }
        }
    }

    #[test]
    fn test_spread_across_members() {
        let members = peers(3);
        let assignment = assign(&members, 300);
        let buckets = assignment.by_member();
        assert_eq!(buckets.len(), 3);
        for partitions in buckets.values() {
            assert!(partitions.len() >= 50, "unbalanced ring: {:?}", buckets);
        }
    }

    #[test]
    fn test_no_peers() {
        let assignment = assign::<String>(&[], 4);
        assert!(assignment.is_empty());
        assert_eq!(assignment.owner(0), None);
        assert!(assignment.partitions_for("10.0.0.1:8177").is_empty());
    }

    #[test]
    fn test_partitions_for() {
        let members = peers(2);
        let assignment = assign(&members, 16);
        let mine = assignment.partitions_for(&members[0]);
        let theirs = assignment.partitions_for(&members[1]);
        assert!(mine.is_disjoint(&theirs));
        assert_eq!(mine.len() + theirs.len(), 16);
    }
}
