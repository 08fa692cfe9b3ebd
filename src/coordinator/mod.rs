//! Partition coordination
//!
//! A node is responsible for:
//! - Membership (registering under a lease, listing live peers)
//! - Placement (consistent-hash assignment of partitions to peers)
//! - Ownership (holding one distributed lock per owned partition)
//! - Liveness (renewing the lease, stopping when it is lost)

pub mod http;
pub mod lease;
pub mod membership;
pub mod ownership;
pub mod placement;
pub mod reconciler;
pub mod semaphore;
pub mod server;
pub mod session;
pub mod supervisor;

pub use http::{StatusServer, StatusState};
pub use lease::LeaseKeeper;
pub use membership::{Member, MembershipRegistry};
pub use ownership::{OwnershipSnapshot, OwnershipTable, OwnershipView};
pub use placement::{assign, Assignment, PartitionAssigner, DEFAULT_VIRTUAL_NODES};
pub use reconciler::{Reconciler, TickReport};
pub use semaphore::{partition_lock_name, PartitionLock};
pub use server::{Coordinator, Service};
pub use session::LockSession;
pub use supervisor::Supervisor;
