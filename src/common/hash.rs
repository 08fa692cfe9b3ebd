//! Hashing utilities for shardkeeper
//!
//! - BLAKE3 for stable ring positions (identical on every node and platform)
//! - Consistent hash ring with virtual nodes for partition placement

/// Map arbitrary bytes onto the 64-bit ring space.
pub fn ring_hash(data: &[u8]) -> u64 {
    let hash = blake3::hash(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// Ring position of one virtual node of `member`.
pub fn vnode_hash(member: &str, vnode: u32) -> u64 {
    ring_hash(format!("{}#{}", member, vnode).as_bytes())
}

/// Ring position of a partition key (its decimal id).
pub fn partition_hash(partition: u32) -> u64 {
    ring_hash(partition.to_string().as_bytes())
}

/// Consistent hash ring
///
/// Every member owns `vnodes` points. A key belongs to the first point at or
/// after its hash, wrapping around to the first point of the ring.
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    members: Vec<String>,
    points: Vec<(u64, usize)>,
}

impl ConsistentHashRing {
    /// Build a ring. Member order and duplicates do not affect placement.
    pub fn new<S: AsRef<str>>(members: &[S], vnodes: u32) -> Self {
        let mut members: Vec<String> = members.iter().map(|m| m.as_ref().to_string()).collect();
        members.sort();
        members.dedup();

        let mut points = Vec::with_capacity(members.len() * vnodes as usize);
        for (idx, member) in members.iter().enumerate() {
            for vnode in 0..vnodes {
                points.push((vnode_hash(member, vnode), idx));
            }
        }
        // members are sorted, so ties on the hash resolve identically everywhere
        points.sort_unstable();

        Self { members, points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Distinct members on the ring, sorted.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Owner of a raw ring position.
    pub fn lookup(&self, hash: u64) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|(point, _)| *point < hash);
        let (_, member) = self.points[idx % self.points.len()];
        Some(self.members[member].as_str())
    }

    /// Owner of a partition.
    pub fn owner(&self, partition: u32) -> Option<&str> {
        self.lookup(partition_hash(partition))
    }
}
