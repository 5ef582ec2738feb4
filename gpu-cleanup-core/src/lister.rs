//! Node listing
//!
//! Reconciling against a partial node list would silently skip nodes, so
//! any failure here aborts the run.

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::cluster::{ClusterClient, ClusterError, Node};

/// Fatal error listing nodes
#[derive(Debug, Error)]
pub enum ListError {
    #[error("failed to list nodes: {0}")]
    Client(#[from] ClusterError),

    #[error("node list contains {0} more than once")]
    DuplicateNode(String),

    #[error("cancelled while listing nodes")]
    Cancelled,
}

/// Fetch a full snapshot of cluster nodes
pub async fn list_nodes(
    client: &dyn ClusterClient,
    timeout: Duration,
) -> Result<Vec<Node>, ListError> {
    let nodes = tokio::time::timeout(timeout, client.list_nodes())
        .await
        .map_err(|_| ClusterError::Timeout(timeout))??;

    let mut seen = HashSet::with_capacity(nodes.len());
    for node in &nodes {
        if !seen.insert(node.name.as_str()) {
            return Err(ListError::DuplicateNode(node.name.clone()));
        }
    }

    info!(count = nodes.len(), "Listed cluster nodes");
    Ok(nodes)
}
