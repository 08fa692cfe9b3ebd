//! Ops commands for cluster inspection

pub mod inspect;

pub use inspect::{inspect_cluster, plan_assignment, plan_moves, ClusterReport, Move};
