//! In-memory cluster client for testing

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ClusterClient, ClusterError, Labels, Node, NodeUpdate};

#[derive(Debug, Clone)]
struct StoredNode {
    labels: Labels,
    version: u64,
}

impl StoredNode {
    fn snapshot(&self, name: &str) -> Node {
        Node::new(name, self.labels.clone()).with_version(self.version.to_string())
    }
}

/// Mock cluster holding nodes in memory
///
/// Enforces resourceVersion checks like the API server does, and can be
/// scripted to fail list, get, or update calls.
pub struct MockCluster {
    nodes: Mutex<BTreeMap<String, StoredNode>>,
    update_faults: Mutex<HashMap<String, VecDeque<ClusterError>>>,
    get_faults: Mutex<HashMap<String, VecDeque<ClusterError>>>,
    list_error: Mutex<Option<ClusterError>>,
    /// Artificial latency added to update calls
    update_delay: Mutex<Option<Duration>>,
    update_calls: Mutex<HashMap<String, u32>>,
    get_calls: AtomicU32,
    list_calls: AtomicU32,
}

impl MockCluster {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            update_faults: Mutex::new(HashMap::new()),
            get_faults: Mutex::new(HashMap::new()),
            list_error: Mutex::new(None),
            update_delay: Mutex::new(None),
            update_calls: Mutex::new(HashMap::new()),
            get_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
        }
    }

    /// Create a mock cluster from `(name, labels)` pairs
    pub async fn with_nodes<I, N>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (N, Labels)>,
        N: Into<String>,
    {
        let cluster = Self::new();
        for (name, labels) in nodes {
            cluster.add_node(name, labels).await;
        }
        cluster
    }

    /// Add or replace a node
    pub async fn add_node(&self, name: impl Into<String>, labels: Labels) {
        let mut nodes = self.nodes.lock().await;
        nodes.insert(name.into(), StoredNode { labels, version: 1 });
    }

    /// Remove a node, as if it was deleted from the cluster
    pub async fn remove_node(&self, name: &str) {
        self.nodes.lock().await.remove(name);
    }

    /// Overwrite a node's labels as another writer would, bumping its version
    pub async fn concurrent_write(&self, name: &str, labels: Labels) {
        let mut nodes = self.nodes.lock().await;
        if let Some(stored) = nodes.get_mut(name) {
            stored.labels = labels;
            stored.version += 1;
        }
    }

    /// Queue an error for the next update of `name`
    ///
    /// A queued `Conflict` also bumps the stored version, so the caller has
    /// to re-read the node before its next write can succeed.
    pub async fn push_update_error(&self, name: &str, error: ClusterError) {
        let mut faults = self.update_faults.lock().await;
        faults.entry(name.to_string()).or_default().push_back(error);
    }

    /// Queue an error for the next get of `name`
    pub async fn push_get_error(&self, name: &str, error: ClusterError) {
        let mut faults = self.get_faults.lock().await;
        faults.entry(name.to_string()).or_default().push_back(error);
    }

    /// Make `list_nodes` fail with `error`
    pub async fn set_list_error(&self, error: ClusterError) {
        *self.list_error.lock().await = Some(error);
    }

    /// Delay every update call by `delay`
    pub async fn set_update_delay(&self, delay: Duration) {
        *self.update_delay.lock().await = Some(delay);
    }

    /// Current labels of a node
    pub async fn labels(&self, name: &str) -> Option<Labels> {
        self.nodes.lock().await.get(name).map(|n| n.labels.clone())
    }

    /// Number of update calls issued for a node
    pub async fn update_calls(&self, name: &str) -> u32 {
        self.update_calls
            .lock()
            .await
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Number of update calls issued across all nodes
    pub async fn total_update_calls(&self) -> u32 {
        self.update_calls.lock().await.values().sum()
    }

    /// Number of get calls issued
    pub fn get_calls(&self) -> u32 {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Number of list calls issued
    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.list_error.lock().await.clone() {
            return Err(err);
        }

        let nodes = self.nodes.lock().await;
        Ok(nodes
            .iter()
            .map(|(name, stored)| stored.snapshot(name))
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self
            .get_faults
            .lock()
            .await
            .get_mut(name)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }

        let nodes = self.nodes.lock().await;
        nodes
            .get(name)
            .map(|stored| stored.snapshot(name))
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    async fn update_node(&self, update: &NodeUpdate) -> Result<Node, ClusterError> {
        *self
            .update_calls
            .lock()
            .await
            .entry(update.name.clone())
            .or_insert(0) += 1;

        let delay = *self.update_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fault = self
            .update_faults
            .lock()
            .await
            .get_mut(&update.name)
            .and_then(|queue| queue.pop_front());

        let mut nodes = self.nodes.lock().await;

        if let Some(err) = fault {
            if err.is_conflict() {
                if let Some(stored) = nodes.get_mut(&update.name) {
                    stored.version += 1;
                }
            }
            return Err(err);
        }

        let stored = nodes
            .get_mut(&update.name)
            .ok_or_else(|| ClusterError::NotFound(update.name.clone()))?;

        if let Some(expected) = &update.resource_version {
            if *expected != stored.version.to_string() {
                return Err(ClusterError::Conflict(update.name.clone()));
            }
        }

        stored.labels = update.labels.clone();
        stored.version += 1;
        Ok(stored.snapshot(&update.name))
    }
}
