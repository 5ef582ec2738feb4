//! Cluster client trait and common types
//!
//! Defines the boundary between the reconciler and whatever talks to the
//! cluster API server.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label mapping attached to a node
pub type Labels = BTreeMap<String, String>;

/// Snapshot of a cluster node as seen by the reconciler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node name
    pub name: String,
    /// Current labels
    #[serde(default)]
    pub labels: Labels,
    /// Opaque version token of this read (resourceVersion)
    #[serde(default)]
    pub resource_version: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, labels: Labels) -> Self {
        Self {
            name: name.into(),
            labels,
            resource_version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = Some(version.into());
        self
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Label write for a single node
///
/// Carries the reduced label mapping together with the version token of the
/// read it was computed from. The write must be rejected with
/// [`ClusterError::Conflict`] if the stored version differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUpdate {
    /// Node name
    pub name: String,
    /// Labels the node should carry after the write
    pub labels: Labels,
    /// Keys dropped from the read snapshot
    pub removed: Vec<String>,
    /// Version token of the snapshot; `None` writes unconditionally
    pub resource_version: Option<String>,
}

/// Errors returned by a cluster client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// Stored version differs from the one the write was based on
    #[error("version conflict on node {0}")]
    Conflict(String),

    /// Node does not exist (anymore)
    #[error("node not found: {0}")]
    NotFound(String),

    /// Credentials rejected or missing permissions
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Request rejected by the API server for a non-retryable reason
    #[error("request rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// Call did not finish before its deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Network failure, throttling, or server-side error
    #[error("transient API error: {0}")]
    Transient(String),
}

/// How the reconciler should react to a [`ClusterError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Re-read the node and try again
    Conflict,
    /// Try the same write again after a backoff
    Transient,
    /// Give up on this node
    Permanent,
}

impl ClusterError {
    /// Classify the error for retry decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            ClusterError::Conflict(_) => ErrorClass::Conflict,
            ClusterError::Timeout(_) | ClusterError::Transient(_) => ErrorClass::Transient,
            ClusterError::NotFound(_)
            | ClusterError::Unauthorized(_)
            | ClusterError::Rejected { .. } => ErrorClass::Permanent,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }

    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Permanent
    }
}

/// Access to cluster nodes
///
/// Implementations must be safe to call from several workers at once.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List every node in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError>;

    /// Read a single node
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;

    /// Write a node's labels, failing with `Conflict` on a stale version
    async fn update_node(&self, update: &NodeUpdate) -> Result<Node, ClusterError>;
}
