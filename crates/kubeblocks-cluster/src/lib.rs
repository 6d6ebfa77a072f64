//! Cluster reconciliation for KubeBlocks
//!
//! A reconcile pass runs a fixed chain of transformers over a
//! [`context::TransformContext`]. The chain resolves the cluster topology,
//! diffs desired against running components and shardings, drives sharding
//! lifecycle actions and aggregates status. Every write is recorded in a
//! [`dag::MutationGraph`] that [`executor::apply_graph`] commits after the
//! chain finishes.

pub mod builder;
pub mod context;
pub mod controller;
pub mod dag;
pub mod executor;
pub mod lifecycle;
pub mod sharding;
pub mod sidecar;
pub mod store;
pub mod transformers;

pub use context::TransformContext;
pub use controller::{error_policy, reconcile, Context, ContextBuilder};
pub use dag::{ClusterObject, MutationGraph, Verb};
pub use store::{ClusterStore, KubeClusterStore, OwnedKind};

/// Controller name used for events and logs
pub const CONTROLLER_NAME: &str = "cluster-controller";

#[cfg(test)]
pub(crate) mod testing;
