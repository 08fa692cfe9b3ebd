//! Common utilities and types shared across shardkeeper

pub mod config;
pub mod error;
pub mod hash;
pub mod utils;

pub use self::config::{BackendConfig, BackendKind, Config};
pub use error::{Error, Result};
pub use hash::{partition_hash, ring_hash, vnode_hash, ConsistentHashRing};
pub use utils::{duration_millis, format_partitions, parse_duration, whole_seconds};
