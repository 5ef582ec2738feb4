//! GPU Cleanup Core Library
//!
//! Label filtering and node reconciliation for removing GPU discovery labels
//! from cluster nodes. The cluster itself is reached through the
//! [`ClusterClient`] trait.

pub mod cluster;
pub mod labels;
pub mod lister;
pub mod metrics;
pub mod outcome;
pub mod reconciler;
pub mod state;

// Re-export common types
pub use cluster::{ClusterClient, ClusterError, Labels, Node, NodeUpdate};
pub use labels::{filter, FilterOutcome, LabelRule, LabelRules, MatchMode, DEFAULT_PATTERNS};
pub use lister::ListError;
pub use outcome::{NodeError, NodeOutcome, NodeReport, ReconcileSummary};
pub use reconciler::{ReconcileConfig, Reconciler};
