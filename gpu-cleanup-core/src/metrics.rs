//! Prometheus metrics for gpu-cleanup

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram, register_int_counter, register_int_counter_vec, Histogram,
    IntCounter, IntCounterVec,
};

/// Nodes by final outcome
static NODE_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("gpu_cleanup_nodes_total", "Nodes processed, by outcome"),
        &["outcome"]
    )
    .expect("Failed to create nodes_total metric")
});

/// Update calls by result
static UPDATE_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "gpu_cleanup_update_attempts_total",
            "Node update calls issued, by result"
        ),
        &["result"]
    )
    .expect("Failed to create update_attempts metric")
});

/// Labels removed across all nodes and runs
static LABELS_REMOVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "gpu_cleanup_labels_removed_total",
        "Node labels removed"
    ))
    .expect("Failed to create labels_removed metric")
});

/// Duration of the whole run
static RUN_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "gpu_cleanup_run_duration_seconds",
        "Duration of a reconciliation run",
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("Failed to create run_duration metric")
});

/// Metrics registry wrapper
pub struct MetricsRegistry;

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        // Force initialization of lazy statics
        let _ = &*NODE_OUTCOMES;
        let _ = &*UPDATE_ATTEMPTS;
        let _ = &*LABELS_REMOVED;
        let _ = &*RUN_DURATION;
        Self
    }

    /// Count a node's final outcome
    pub fn inc_node_outcome(&self, outcome: &str) {
        NODE_OUTCOMES.with_label_values(&[outcome]).inc();
    }

    /// Count an update call (`ok`, `conflict`, `transient`, `permanent`, `timeout`)
    pub fn inc_update_attempt(&self, result: &str) {
        UPDATE_ATTEMPTS.with_label_values(&[result]).inc();
    }

    /// Add to the removed label count
    pub fn add_labels_removed(&self, count: usize) {
        LABELS_REMOVED.inc_by(count as u64);
    }

    /// Record run duration
    pub fn observe_run_duration(&self, duration_secs: f64) {
        RUN_DURATION.observe(duration_secs);
    }

    /// Render every registered metric in the text exposition format
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        prometheus::TextEncoder::new().encode_to_string(&prometheus::gather())
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
