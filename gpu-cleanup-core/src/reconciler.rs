//! Node label reconciler
//!
//! Lists every node, filters its labels and writes back the ones that
//! changed. Nodes are handled independently by a bounded pool of workers:
//! a failure on one node never stops the others.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, ClusterError, ErrorClass, Labels, Node, NodeUpdate};
use crate::labels::{FilterOutcome, LabelRules};
use crate::lister::{self, ListError};
use crate::metrics::MetricsRegistry;
use crate::outcome::{NodeError, NodeOutcome, NodeReport, ReconcileSummary};
use crate::state::{NodeProgress, NodeState};

/// Reconciler tuning
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Nodes processed at the same time
    pub concurrency: usize,
    /// Update attempts per node, including the first one
    pub max_attempts: u32,
    /// Delay before retrying a transient failure, doubled on each retry
    pub retry_backoff: Duration,
    /// Deadline for every single cluster call
    pub request_timeout: Duration,
    /// Report what would change without writing
    pub dry_run: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            request_timeout: Duration::from_secs(30),
            dry_run: false,
        }
    }
}

/// Why a cluster call did not produce a value
#[derive(Debug)]
enum Interrupt {
    Cancelled,
    Cluster(ClusterError),
}

/// Write state of a node between attempts
struct PendingWrite {
    filtered: FilterOutcome,
    resource_version: Option<String>,
    /// Last write conflicted, node must be re-read first
    stale: bool,
    /// Keys of an earlier write whose reply never arrived; it may have landed
    in_doubt: Option<Vec<String>>,
}

impl PendingWrite {
    fn new(node: Node, filtered: FilterOutcome) -> Self {
        Self {
            filtered,
            resource_version: node.resource_version,
            stale: false,
            in_doubt: None,
        }
    }

    fn refresh(&mut self, rules: &LabelRules, node: Node) {
        self.filtered = rules.filter(&node.labels);
        self.resource_version = node.resource_version;
        self.stale = false;
    }

    fn update(&self, name: &str) -> NodeUpdate {
        NodeUpdate {
            name: name.to_string(),
            labels: self.filtered.remaining.clone(),
            removed: self.filtered.removed.clone(),
            resource_version: self.resource_version.clone(),
        }
    }

    /// Keys of an in-doubt write that are gone from `labels`
    fn landed(&self, labels: &Labels) -> Option<Vec<String>> {
        self.in_doubt
            .as_ref()
            .filter(|keys| keys.iter().all(|k| !labels.contains_key(k)))
            .cloned()
    }
}

/// Resolves once `shutdown` carries `true`; never resolves if the sender is gone
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Removes GPU discovery labels from cluster nodes
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    rules: LabelRules,
    config: ReconcileConfig,
    metrics: Arc<MetricsRegistry>,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(
        client: Arc<dyn ClusterClient>,
        rules: LabelRules,
        config: ReconcileConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            client,
            rules,
            config,
            metrics,
        }
    }

    pub fn rules(&self) -> &LabelRules {
        &self.rules
    }

    /// List all nodes and reconcile them
    ///
    /// Only listing failures are returned as errors; per-node failures end
    /// up in the summary.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ReconcileSummary, ListError> {
        let start = Instant::now();
        info!(
            rules = ?self.rules.rules().iter().map(ToString::to_string).collect::<Vec<_>>(),
            concurrency = self.config.concurrency,
            dry_run = self.config.dry_run,
            "Starting GPU label cleanup"
        );

        let nodes = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => return Err(ListError::Cancelled),
            res = lister::list_nodes(self.client.as_ref(), self.config.request_timeout) => res?,
        };

        let summary = self.reconcile(nodes, shutdown).await;

        self.metrics.observe_run_duration(start.elapsed().as_secs_f64());
        info!(
            total = summary.total,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            duration = ?start.elapsed(),
            "Reconciliation complete"
        );
        Ok(summary)
    }

    /// Reconcile a node snapshot
    pub async fn reconcile(
        &self,
        nodes: Vec<Node>,
        shutdown: watch::Receiver<bool>,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::new();
        let concurrency = self.config.concurrency.max(1);

        let reports: Vec<NodeReport> = stream::iter(nodes)
            .map(|node| self.reconcile_node(node, shutdown.clone()))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for report in reports {
            self.metrics.inc_node_outcome(report.outcome.as_str());
            if let NodeOutcome::Updated { removed } = &report.outcome {
                self.metrics.add_labels_removed(removed.len());
            }
            summary.record(report);
        }

        summary.finish()
    }

    /// Read-filter-write a single node
    async fn reconcile_node(
        &self,
        node: Node,
        mut shutdown: watch::Receiver<bool>,
    ) -> NodeReport {
        let name = node.name.clone();
        let mut progress = NodeProgress::new(&name);

        if *shutdown.borrow() {
            progress.advance(NodeState::Failed);
            return report(&name, failed(NodeError::Cancelled), 0);
        }

        let filtered = self.rules.filter(&node.labels);
        if !filtered.changed() {
            debug!(node = %name, "No GPU labels on node");
            progress.advance(NodeState::Skipped);
            return report(&name, NodeOutcome::Skipped, 0);
        }

        // dry run never leaves UNEXAMINED
        if self.config.dry_run {
            info!(node = %name, labels = ?filtered.removed, "[DRY-RUN] Would remove labels");
            return report(
                &name,
                NodeOutcome::DryRun {
                    removed: filtered.removed,
                },
                0,
            );
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.retry_backoff;
        let mut pending = PendingWrite::new(node, filtered);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match self
                .try_write(&name, &mut pending, &mut progress, &mut shutdown)
                .await
            {
                Ok(outcome) => return report(&name, outcome, attempt),
                Err(Interrupt::Cancelled) => {
                    warn!(node = %name, "Cancelled before node update completed");
                    progress.advance(NodeState::Failed);
                    return report(&name, failed(NodeError::Cancelled), attempt);
                }
                Err(Interrupt::Cluster(err)) => err,
            };

            match err.class() {
                ErrorClass::Permanent => {
                    warn!(node = %name, error = %err, "Node update failed");
                    progress.advance(NodeState::Failed);
                    return report(&name, failed(NodeError::Cluster(err)), attempt);
                }
                _ if attempt >= max_attempts => {
                    warn!(
                        node = %name,
                        attempts = attempt,
                        error = %err,
                        "Node update retries exhausted"
                    );
                    progress.advance(NodeState::Failed);
                    let error = NodeError::RetriesExhausted {
                        attempts: attempt,
                        last: err,
                    };
                    return report(&name, failed(error), attempt);
                }
                ErrorClass::Conflict => {
                    debug!(node = %name, attempt, "Version conflict, re-reading node");
                    if progress.state() != NodeState::ConflictRetry {
                        progress.advance(NodeState::ConflictRetry);
                    }
                    pending.stale = true;
                }
                ErrorClass::Transient => {
                    debug!(
                        node = %name,
                        attempt,
                        backoff = ?backoff,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancelled(&mut shutdown) => {
                            progress.advance(NodeState::Failed);
                            return report(&name, failed(NodeError::Cancelled), attempt);
                        }
                    }
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    /// One attempt: re-read if stale, then write
    async fn try_write(
        &self,
        name: &str,
        pending: &mut PendingWrite,
        progress: &mut NodeProgress<'_>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<NodeOutcome, Interrupt> {
        if pending.stale {
            let fresh = self.guarded(self.client.get_node(name), shutdown).await?;
            let landed = pending.landed(&fresh.labels);
            pending.refresh(&self.rules, fresh);
            if !pending.filtered.changed() {
                if let Some(removed) = landed {
                    info!(
                        node = %name,
                        removed = ?removed,
                        "Earlier unacknowledged update was applied"
                    );
                    progress.advance(NodeState::PendingUpdate);
                    progress.advance(NodeState::Updated);
                    return Ok(NodeOutcome::Updated { removed });
                }
                info!(node = %name, "GPU labels already removed by another writer");
                progress.advance(NodeState::Skipped);
                return Ok(NodeOutcome::Skipped);
            }
        }

        progress.advance(NodeState::PendingUpdate);
        let update = pending.update(name);

        match self.guarded(self.client.update_node(&update), shutdown).await {
            Ok(_) => {
                self.metrics.inc_update_attempt("ok");
                progress.advance(NodeState::Updated);
                info!(node = %name, removed = ?update.removed, "Removed GPU labels");
                Ok(NodeOutcome::Updated {
                    removed: update.removed,
                })
            }
            Err(Interrupt::Cluster(err)) => {
                self.metrics.inc_update_attempt(attempt_result(&err));
                if err.class() == ErrorClass::Transient {
                    pending.in_doubt = Some(update.removed);
                }
                Err(Interrupt::Cluster(err))
            }
            Err(Interrupt::Cancelled) => {
                warn!(
                    node = %name,
                    removed = ?update.removed,
                    "Cancelled with update in flight, its result is unknown"
                );
                Err(Interrupt::Cancelled)
            }
        }
    }

    /// Run a cluster call under the request deadline and the shutdown signal
    async fn guarded<T, F>(
        &self,
        call: F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<T, Interrupt>
    where
        F: Future<Output = Result<T, ClusterError>>,
    {
        let timeout = self.config.request_timeout;
        tokio::select! {
            biased;
            _ = cancelled(shutdown) => Err(Interrupt::Cancelled),
            res = tokio::time::timeout(timeout, call) => match res {
                Ok(result) => result.map_err(Interrupt::Cluster),
                Err(_) => Err(Interrupt::Cluster(ClusterError::Timeout(timeout))),
            },
        }
    }
}

fn report(node: &str, outcome: NodeOutcome, attempts: u32) -> NodeReport {
    NodeReport {
        node: node.to_string(),
        outcome,
        attempts,
    }
}

fn failed(error: NodeError) -> NodeOutcome {
    NodeOutcome::Failed { error }
}

fn attempt_result(err: &ClusterError) -> &'static str {
    match err {
        ClusterError::Timeout(_) => "timeout",
        _ => match err.class() {
            ErrorClass::Conflict => "conflict",
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use async_trait::async_trait;

    /// Applies updates, then answers after `reply_delay`
    struct SlowReplyCluster {
        inner: MockCluster,
        reply_delay: Duration,
    }

    #[async_trait]
    impl ClusterClient for SlowReplyCluster {
        async fn list_nodes(&self) -> Result<Vec<Node>, ClusterError> {
            self.inner.list_nodes().await
        }

        async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
            self.inner.get_node(name).await
        }

        async fn update_node(&self, update: &NodeUpdate) -> Result<Node, ClusterError> {
            let node = self.inner.update_node(update).await?;
            tokio::time::sleep(self.reply_delay).await;
            Ok(node)
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn gpu_labels(zone: &str) -> Labels {
        labels(&[
            ("nvidia.com/gpu.present", "true"),
            ("nvidia.com/gpu.deploy.driver", "true"),
            ("zone", zone),
        ])
    }

    fn test_config() -> ReconcileConfig {
        ReconcileConfig {
            retry_backoff: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
            ..ReconcileConfig::default()
        }
    }

    fn reconciler(cluster: Arc<MockCluster>, config: ReconcileConfig) -> Reconciler {
        Reconciler::new(
            cluster,
            LabelRules::default(),
            config,
            Arc::new(MetricsRegistry::new()),
        )
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // keep the channel open for the whole test
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_empty_cluster() {
        let cluster = Arc::new(MockCluster::new());
        let summary = reconciler(cluster.clone(), test_config())
            .run(no_shutdown())
            .await
            .unwrap();

        assert_eq!(summary.total, 0);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.failed, 0);
        assert!(summary.failed_nodes.is_empty());
        assert_eq!(cluster.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_removes_labels_from_matching_node() {
        let cluster = Arc::new(
            MockCluster::with_nodes([(
                "n1",
                labels(&[("nvidia.com/gpu.present", "true"), ("zone", "us-east")]),
            )])
            .await,
        );

        let summary = reconciler(cluster.clone(), test_config())
            .run(no_shutdown())
            .await
            .unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(summary.skipped, 0);
        assert_eq!(
            cluster.labels("n1").await.unwrap(),
            labels(&[("zone", "us-east")])
        );
        assert!(summary.report("n1").unwrap().outcome.modified());
    }

    #[tokio::test]
    async fn test_clean_node_is_never_written() {
        let cluster =
            Arc::new(MockCluster::with_nodes([("n2", labels(&[("zone", "us-west")]))]).await);

        let summary = reconciler(cluster.clone(), test_config())
            .run(no_shutdown())
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.updated, 0);
        assert_eq!(cluster.update_calls("n2").await, 0);
        assert_eq!(
            cluster.labels("n2").await.unwrap(),
            labels(&[("zone", "us-west")])
        );
    }

    #[tokio::test]
    async fn test_conflict_retried_until_success() {
        let cluster = Arc::new(MockCluster::with_nodes([("n3", gpu_labels("eu"))]).await);
        for _ in 0..2 {
            cluster
                .push_update_error("n3", ClusterError::Conflict("n3".into()))
                .await;
        }

        let summary = reconciler(cluster.clone(), test_config())
            .run(no_shutdown())
            .await
            .unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.report("n3").unwrap().attempts, 3);
        assert_eq!(cluster.update_calls("n3").await, 3);
        assert_eq!(cluster.get_calls(), 2);
        assert_eq!(cluster.labels("n3").await.unwrap(), labels(&[("zone", "eu")]));
    }

    #[tokio::test]
    async fn test_conflict_retries_exhausted() {
        let cluster = Arc::new(MockCluster::with_nodes([("n3", gpu_labels("eu"))]).await);
        for _ in 0..3 {
            cluster
                .push_update_error("n3", ClusterError::Conflict("n3".into()))
                .await;
        }

        let summary = reconciler(cluster.clone(), test_config())
            .run(no_shutdown())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_nodes, vec!["n3".to_string()]);
        assert!(matches!(
            &summary.report("n3").unwrap().outcome,
            NodeOutcome::Failed {
                error: NodeError::RetriesExhausted { attempts: 3, .. }
            }
        ));
        assert_eq!(cluster.update_calls("n3").await, 3);
        assert_eq!(cluster.labels("n3").await.unwrap(), gpu_labels("eu"));
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_stop_run() {
        let cluster = Arc::new(
            MockCluster::with_nodes([
                ("n1", gpu_labels("a")),
                ("n2", labels(&[("zone", "b")])),
                ("n4", gpu_labels("c")),
                ("n5", gpu_labels("d")),
                ("n6", labels(&[("zone", "e")])),
            ])
            .await,
        );
        cluster
            .push_update_error("n4", ClusterError::Unauthorized("nodes is forbidden".into()))
            .await;

        let config = ReconcileConfig {
            concurrency: 1,
            ..test_config()
        };
        let summary = reconciler(cluster.clone(), config)
            .run(no_shutdown())
            .await
            .unwrap();

        assert_eq!(summary.total, 5);
        assert_eq!(summary.updated, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_nodes, vec!["n4".to_string()]);
        assert!(!summary.is_success());
        // permanent errors are not retried
        assert_eq!(cluster.update_calls("n4").await, 1);
        assert_eq!(cluster.labels("n5").await.unwrap(), labels(&[("zone", "d")]));
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let cluster = Arc::new(MockCluster::with_nodes([("n1", gpu_labels("a"))]).await);
        cluster
            .push_update_error("n1", ClusterError::Transient("connection reset".into()))
            .await;

        let summary = reconciler(cluster.clone(), test_config())
            .run(no_shutdown())
            .await
            .unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(cluster.update_calls("n1").await, 2);
        // same version still valid, no re-read
        assert_eq!(cluster.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_update_deadline() {
        let cluster = Arc::new(MockCluster::with_nodes([("n1", gpu_labels("a"))]).await);
        cluster.set_update_delay(Duration::from_millis(500)).await;

        let config = ReconcileConfig {
            max_attempts: 2,
            request_timeout: Duration::from_millis(20),
            ..test_config()
        };
        let nodes = cluster.list_nodes().await.unwrap();
        let summary = reconciler(cluster.clone(), config)
            .reconcile(nodes, no_shutdown())
            .await;

        assert_eq!(summary.failed, 1);
        assert!(matches!(
            &summary.report("n1").unwrap().outcome,
            NodeOutcome::Failed {
                error: NodeError::RetriesExhausted {
                    attempts: 2,
                    last: ClusterError::Timeout(_)
                }
            }
        ));
        assert_eq!(cluster.labels("n1").await.unwrap(), gpu_labels("a"));
    }

    #[tokio::test]
    async fn test_node_cleaned_by_another_writer() {
        let cluster = Arc::new(MockCluster::with_nodes([("n1", gpu_labels("a"))]).await);
        let snapshot = cluster.list_nodes().await.unwrap();
        cluster.concurrent_write("n1", labels(&[("zone", "a")])).await;

        let summary = reconciler(cluster.clone(), test_config())
            .reconcile(snapshot, no_shutdown())
            .await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(cluster.update_calls("n1").await, 1);
        assert_eq!(cluster.get_calls(), 1);
    }

    #[tokio::test]
    async fn test_update_applied_but_reply_lost() {
        let cluster = Arc::new(SlowReplyCluster {
            inner: MockCluster::with_nodes([(
                "n1",
                labels(&[("nvidia.com/gpu.present", "true"), ("zone", "us-east")]),
            )])
            .await,
            reply_delay: Duration::from_millis(200),
        });
        let config = ReconcileConfig {
            request_timeout: Duration::from_millis(50),
            ..test_config()
        };

        let summary = Reconciler::new(
            cluster.clone(),
            LabelRules::default(),
            config,
            Arc::new(MetricsRegistry::new()),
        )
        .run(no_shutdown())
        .await
        .unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(summary.skipped, 0);
        let report = summary.report("n1").unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(
            report.outcome,
            NodeOutcome::Updated {
                removed: vec!["nvidia.com/gpu.present".to_string()]
            }
        );
        assert_eq!(
            cluster.inner.labels("n1").await.unwrap(),
            labels(&[("zone", "us-east")])
        );
    }

    #[tokio::test]
    async fn test_reread_transient_failure_retried() {
        let cluster = Arc::new(MockCluster::with_nodes([("n3", gpu_labels("eu"))]).await);
        cluster
            .push_update_error("n3", ClusterError::Conflict("n3".into()))
            .await;
        cluster
            .push_get_error("n3", ClusterError::Transient("connection reset".into()))
            .await;

        let summary = reconciler(cluster.clone(), test_config())
            .run(no_shutdown())
            .await
            .unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(summary.report("n3").unwrap().attempts, 3);
        // the failed read counts as an attempt and is repeated
        assert_eq!(cluster.get_calls(), 2);
        assert_eq!(cluster.update_calls("n3").await, 2);
        assert_eq!(cluster.labels("n3").await.unwrap(), labels(&[("zone", "eu")]));
    }

    #[tokio::test]
    async fn test_reread_not_found_fails_node() {
        let cluster = Arc::new(MockCluster::with_nodes([("n3", gpu_labels("eu"))]).await);
        cluster
            .push_update_error("n3", ClusterError::Conflict("n3".into()))
            .await;
        cluster
            .push_get_error("n3", ClusterError::NotFound("n3".into()))
            .await;

        let summary = reconciler(cluster.clone(), test_config())
            .run(no_shutdown())
            .await
            .unwrap();

        let report = summary.report("n3").unwrap();
        assert_eq!(report.attempts, 2);
        assert!(matches!(
            &report.outcome,
            NodeOutcome::Failed {
                error: NodeError::Cluster(ClusterError::NotFound(_))
            }
        ));
        assert_eq!(cluster.get_calls(), 1);
        assert_eq!(cluster.update_calls("n3").await, 1);
        assert_eq!(summary.failed_nodes, vec!["n3".to_string()]);
    }

    #[tokio::test]
    async fn test_deleted_node_fails_without_retry() {
        let cluster = Arc::new(
            MockCluster::with_nodes([("n1", gpu_labels("a")), ("n2", gpu_labels("b"))]).await,
        );
        let snapshot = cluster.list_nodes().await.unwrap();
        cluster.remove_node("n1").await;

        let summary = reconciler(cluster.clone(), test_config())
            .reconcile(snapshot, no_shutdown())
            .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.updated, 1);
        assert!(matches!(
            &summary.report("n1").unwrap().outcome,
            NodeOutcome::Failed {
                error: NodeError::Cluster(ClusterError::NotFound(_))
            }
        ));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let cluster = Arc::new(
            MockCluster::with_nodes([("n1", gpu_labels("a")), ("n2", labels(&[("zone", "b")]))])
                .await,
        );
        let config = ReconcileConfig {
            dry_run: true,
            ..test_config()
        };

        let summary = reconciler(cluster.clone(), config)
            .run(no_shutdown())
            .await
            .unwrap();

        assert_eq!(summary.would_update, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.updated, 0);
        assert_eq!(cluster.total_update_calls().await, 0);
        assert_eq!(cluster.get_calls(), 0);
        assert_eq!(cluster.labels("n1").await.unwrap(), gpu_labels("a"));
        assert_eq!(
            summary.report("n1").unwrap().outcome,
            NodeOutcome::DryRun {
                removed: vec![
                    "nvidia.com/gpu.deploy.driver".to_string(),
                    "nvidia.com/gpu.present".to_string()
                ]
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cluster = Arc::new(
            MockCluster::with_nodes([("n1", gpu_labels("a")), ("n2", gpu_labels("b"))]).await,
        );
        let snapshot = cluster.list_nodes().await.unwrap();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let summary = reconciler(cluster.clone(), test_config())
            .reconcile(snapshot, rx)
            .await;

        assert_eq!(summary.failed, 2);
        assert_eq!(cluster.total_update_calls().await, 0);
        assert!(summary
            .nodes
            .iter()
            .all(|r| r.outcome == failed(NodeError::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_in_flight_leaves_node_untouched() {
        let cluster = Arc::new(MockCluster::with_nodes([("n1", gpu_labels("a"))]).await);
        cluster.set_update_delay(Duration::from_secs(5)).await;
        let snapshot = cluster.list_nodes().await.unwrap();

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
            // hold the sender until the receiver observed the change
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let start = Instant::now();
        let summary = reconciler(cluster.clone(), test_config())
            .reconcile(snapshot, rx)
            .await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(summary.failed, 1);
        let report = summary.report("n1").unwrap();
        assert_eq!(report.outcome, failed(NodeError::Cancelled));
        assert_eq!(report.attempts, 1);
        assert_eq!(cluster.update_calls("n1").await, 1);
        assert_eq!(cluster.labels("n1").await.unwrap(), gpu_labels("a"));
    }

    #[tokio::test]
    async fn test_run_cancelled_during_listing() {
        let cluster = Arc::new(MockCluster::new());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = reconciler(cluster, test_config()).run(rx).await.unwrap_err();
        assert!(matches!(err, ListError::Cancelled));
    }

    #[tokio::test]
    async fn test_list_failure_aborts_run() {
        let cluster = Arc::new(MockCluster::with_nodes([("n1", gpu_labels("a"))]).await);
        cluster
            .set_list_error(ClusterError::Transient("connection refused".into()))
            .await;

        let result = reconciler(cluster.clone(), test_config())
            .run(no_shutdown())
            .await;

        assert!(result.is_err());
        assert_eq!(cluster.total_update_calls().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_matches_sequential() {
        let nodes: Vec<(String, Labels)> = (0..40)
            .map(|i| {
                let labels = if i % 3 == 0 {
                    labels(&[("zone", "x")])
                } else {
                    gpu_labels("x")
                };
                (format!("node-{:02}", i), labels)
            })
            .collect();

        let sequential = Arc::new(MockCluster::with_nodes(nodes.clone()).await);
        let concurrent = Arc::new(MockCluster::with_nodes(nodes).await);

        let seq = reconciler(
            sequential.clone(),
            ReconcileConfig {
                concurrency: 1,
                ..test_config()
            },
        )
        .run(no_shutdown())
        .await
        .unwrap();
        let con = reconciler(
            concurrent.clone(),
            ReconcileConfig {
                concurrency: 8,
                ..test_config()
            },
        )
        .run(no_shutdown())
        .await
        .unwrap();

        assert_eq!(seq.total, 40);
        assert_eq!(seq.updated, con.updated);
        assert_eq!(seq.skipped, con.skipped);
        assert_eq!(seq.failed, 0);
        assert_eq!(con.failed, 0);
        let names = |s: &ReconcileSummary| {
            s.nodes.iter().map(|r| r.node.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&seq), names(&con));
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let cluster = Arc::new(
            MockCluster::with_nodes([("n1", gpu_labels("a")), ("n2", gpu_labels("b"))]).await,
        );
        let reconciler = reconciler(cluster.clone(), test_config());

        let first = reconciler.run(no_shutdown()).await.unwrap();
        let second = reconciler.run(no_shutdown()).await.unwrap();

        assert_eq!(first.updated, 2);
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(cluster.total_update_calls().await, 2);
    }
}
