//! Cluster access layer
//!
//! The reconciler only sees the [`ClusterClient`] trait; the Kubernetes
//! implementation lives in `gpu-cleanup-k8s`.

mod interface;
mod mock;

pub use interface::*;
pub use mock::MockCluster;
