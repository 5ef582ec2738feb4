//! Kubernetes Client wrapper
//!
//! Implements [`ClusterClient`] on top of the Kubernetes node API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node as KubeNode;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, Config, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use gpu_cleanup_core::cluster::{ClusterClient, ClusterError, Node, NodeUpdate};

/// Field manager recorded on every patch
pub const FIELD_MANAGER: &str = "gpu-cleanup";

/// Default number of nodes fetched per list page
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Kubernetes client wrapper
pub struct K8sClient {
    client: Client,
    page_size: u32,
}

impl K8sClient {
    /// Create a new K8s client from in-cluster config or the local kubeconfig
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        info!("Connected to Kubernetes API server");
        Ok(Self {
            client,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Create a new K8s client with custom config
    pub fn with_config(config: Config) -> Result<Self> {
        let client =
            Client::try_from(config).context("Failed to create Kubernetes client from config")?;

        Ok(Self {
            client,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Set the list page size (0 disables paging)
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Get node API
    pub fn nodes(&self) -> Api<KubeNode> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterClient for K8sClient {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
        let mut params = ListParams::default();
        if self.page_size > 0 {
            params = params.limit(self.page_size);
        }

        let mut nodes = Vec::new();
        loop {
            let page = self
                .nodes()
                .list(&params)
                .await
                .map_err(|e| classify_error("<list>", e))?;
            nodes.extend(page.items.iter().map(to_node));

            match page.metadata.continue_.filter(|token| !token.is_empty()) {
                Some(token) => {
                    debug!(fetched = nodes.len(), "Fetching next node page");
                    params = params.continue_token(&token);
                }
                None => break,
            }
        }

        Ok(nodes)
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        self.nodes()
            .get(name)
            .await
            .map(|node| to_node(&node))
            .map_err(|e| classify_error(name, e))
    }

    async fn update_node(&self, update: &NodeUpdate) -> Result<Node, ClusterError> {
        let patch = label_patch(update);
        let params = PatchParams::apply(FIELD_MANAGER);

        let node = self
            .nodes()
            .patch(&update.name, &params, &Patch::Merge(&patch))
            .await
            .map_err(|e| classify_error(&update.name, e))?;

        debug!(
            node = %update.name,
            resource_version = ?node.metadata.resource_version,
            "Node labels patched"
        );
        Ok(to_node(&node))
    }
}

/// Convert an API node into the reconciler's view of it
pub fn to_node(node: &KubeNode) -> Node {
    Node {
        name: node.name_any(),
        labels: node.metadata.labels.clone().unwrap_or_default(),
        resource_version: node.metadata.resource_version.clone(),
    }
}

/// Build a JSON merge patch deleting the removed label keys
///
/// The resourceVersion makes the API server reject the patch with 409 when
/// the node changed since it was read.
pub fn label_patch(update: &NodeUpdate) -> Value {
    let labels: Map<String, Value> = update
        .removed
        .iter()
        .map(|key| (key.clone(), Value::Null))
        .collect();

    let mut metadata = json!({ "labels": labels });
    if let Some(version) = &update.resource_version {
        metadata["resourceVersion"] = json!(version);
    }

    json!({ "metadata": metadata })
}

/// Map a kube error onto the reconciler's error classes
pub fn classify_error(node: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            409 => ClusterError::Conflict(node.to_string()),
            404 => ClusterError::NotFound(node.to_string()),
            401 | 403 => ClusterError::Unauthorized(resp.message),
            408 | 429 | 500..=599 => ClusterError::Transient(resp.message),
            code => ClusterError::Rejected {
                code,
                message: resp.message,
            },
        },
        kube::Error::Auth(e) => ClusterError::Unauthorized(e.to_string()),
        kube::Error::SerdeError(e) => ClusterError::Rejected {
            code: 0,
            message: e.to_string(),
        },
        other => ClusterError::Transient(other.to_string()),
    }
}
