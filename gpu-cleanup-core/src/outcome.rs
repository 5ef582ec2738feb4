//! Per-node outcomes and the run summary

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::cluster::ClusterError;

/// Why a node could not be reconciled
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    /// Permanent client error, not retried
    #[error("{0}")]
    Cluster(ClusterError),

    /// Every attempt failed with a conflict or transient error
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ClusterError },

    /// Run was cancelled before the node finished
    #[error("cancelled")]
    Cancelled,
}

impl Serialize for NodeError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Final result for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// No GPU labels, no write issued
    Skipped,
    /// Labels removed and write accepted
    Updated { removed: Vec<String> },
    /// Labels would have been removed (dry run)
    DryRun { removed: Vec<String> },
    /// Node could not be reconciled
    Failed { error: NodeError },
}

impl NodeOutcome {
    /// Whether the node's labels were rewritten
    pub fn modified(&self) -> bool {
        matches!(self, NodeOutcome::Updated { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, NodeOutcome::Failed { .. })
    }

    /// Short label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeOutcome::Skipped => "skipped",
            NodeOutcome::Updated { .. } => "updated",
            NodeOutcome::DryRun { .. } => "dry_run",
            NodeOutcome::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutcome::Skipped => write!(f, "unchanged"),
            NodeOutcome::Updated { removed } => {
                write!(f, "modified (removed {})", removed.join(", "))
            }
            NodeOutcome::DryRun { removed } => {
                write!(f, "would remove {}", removed.join(", "))
            }
            NodeOutcome::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Outcome of one node, with the number of write attempts it took
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub node: String,
    #[serde(flatten)]
    pub outcome: NodeOutcome,
    pub attempts: u32,
}

/// Aggregated result of a reconciliation run
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub total: usize,
    pub skipped: usize,
    pub updated: usize,
    pub failed: usize,
    /// Nodes that would have been updated in dry-run mode
    pub would_update: usize,
    /// Names of nodes that failed, sorted
    pub failed_nodes: Vec<String>,
    /// Per-node reports, sorted by node name
    pub nodes: Vec<NodeReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconcileSummary {
    /// Empty summary for a run starting now
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            total: 0,
            skipped: 0,
            updated: 0,
            failed: 0,
            would_update: 0,
            failed_nodes: Vec::new(),
            nodes: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    /// Add one node's report
    pub fn record(&mut self, report: NodeReport) {
        self.total += 1;
        match &report.outcome {
            NodeOutcome::Skipped => self.skipped += 1,
            NodeOutcome::Updated { .. } => self.updated += 1,
            NodeOutcome::DryRun { .. } => self.would_update += 1,
            NodeOutcome::Failed { .. } => {
                self.failed += 1;
                self.failed_nodes.push(report.node.clone());
            }
        }
        self.nodes.push(report);
    }

    /// Sort reports and stamp the finish time
    pub fn finish(mut self) -> Self {
        self.nodes.sort_by(|a, b| a.node.cmp(&b.node));
        self.failed_nodes.sort();
        self.finished_at = Utc::now();
        self
    }

    /// Every node reached a non-failed outcome
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn report(&self, node: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|r| r.node == node)
    }
}

impl Default for ReconcileSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} updated={} skipped={} failed={}",
            self.total, self.updated, self.skipped, self.failed
        )?;
        if self.would_update > 0 {
            write!(f, " would_update={}", self.would_update)?;
        }
        if !self.failed_nodes.is_empty() {
            write!(f, " failed_nodes=[{}]", self.failed_nodes.join(", "))?;
        }
        Ok(())
    }
}
