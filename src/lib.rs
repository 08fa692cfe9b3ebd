//! # shardkeeper
//!
//! Partition ownership for horizontally scaled services:
//! - Membership registry backed by leased keys in a coordination store
//! - Consistent-hash assignment of a fixed partition range to live peers
//! - One distributed lock per owned partition, held for the lease lifetime
//! - Fail-fast liveness: a lost lease stops the node (or rejoins)
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │       Coordination store (etcd)          │
//! │  /services/{svc}/members/{id}   (leased) │
//! │  /services/{svc}/partitions/{p} (locks)  │
//! └───────────┬──────────────────────────────┘
//!             │ lease keepalive / list / lock
//!   ┌─────────┴──────────┬──────────────┐
//!   │                    │              │
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼────────┐
//! │ Node A     │   │ Node B     │   │ Node C     │
//! │ keeper     │   │ keeper     │   │ keeper     │
//! │ reconciler │   │ reconciler │   │ reconciler │
//! │ 0-3,9      │   │ 4-6        │   │ 7-8        │
//! └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Run a node
//! ```bash
//! shardkeeper serve \
//!   --service orders \
//!   --address 10.0.0.1:8177 \
//!   --partitions 16 \
//!   --endpoints etcd-0:2379,etcd-1:2379
//! ```
//!
//! ### Inspect a service
//! ```bash
//! shardkeeper inspect --service orders
//! ```
//!
//! ### Preview an assignment offline
//! ```bash
//! shardkeeper assign --partitions 16 10.0.0.1:8177 10.0.0.2:8177
//! ```

pub mod backend;
pub mod common;
pub mod coordinator;
pub mod ops;

pub use backend::{CoordinationBackend, MemoryBackend};
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, OwnershipView, Service};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
