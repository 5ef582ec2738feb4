//! Configuration module for gpu-cleanup
//!
//! Settings come from an optional YAML file, overridden by CLI flags and
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use gpu_cleanup_core::{LabelRules, MatchMode, ReconcileConfig, DEFAULT_PATTERNS};

use crate::cli::Cli;

/// Retry configuration for node updates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Update attempts per node, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before retrying a transient failure
    #[serde(with = "humantime_serde", default = "default_backoff")]
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Write the text exposition here after the run
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Label key patterns to remove
    #[serde(default = "default_label_patterns")]
    pub label_patterns: Vec<String>,

    /// How patterns are matched against keys
    #[serde(default)]
    pub match_mode: MatchMode,

    /// Nodes processed concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Deadline for each API request
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Cancel the whole run after this long
    #[serde(with = "humantime_serde", default)]
    pub deadline: Option<Duration>,

    /// Nodes fetched per list request (0 disables paging)
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Dry run mode - report changes without writing
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            label_patterns: default_label_patterns(),
            match_mode: MatchMode::default(),
            concurrency: default_concurrency(),
            request_timeout: default_request_timeout(),
            deadline: None,
            page_size: default_page_size(),
            retry: RetryConfig::default(),
            metrics: MetricsConfig::default(),
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Apply CLI overrides
    pub fn apply_cli(&mut self, cli: &Cli) {
        if !cli.label_patterns.is_empty() {
            self.label_patterns = cli.label_patterns.clone();
        }
        if let Some(mode) = cli.match_mode {
            self.match_mode = mode.into();
        }
        if let Some(concurrency) = cli.concurrency {
            self.concurrency = concurrency;
        }
        if let Some(max_attempts) = cli.max_attempts {
            self.retry.max_attempts = max_attempts;
        }
        if let Some(timeout) = cli.request_timeout {
            self.request_timeout = timeout;
        }
        if cli.deadline.is_some() {
            self.deadline = cli.deadline;
        }
        if let Some(page_size) = cli.page_size {
            self.page_size = page_size;
        }
        if cli.metrics_file.is_some() {
            self.metrics.textfile = cli.metrics_file.clone();
        }
        if cli.dry_run {
            self.dry_run = true;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.label_patterns.is_empty() {
            anyhow::bail!("at least one label pattern is required");
        }
        if self.label_patterns.iter().any(|p| p.trim().is_empty()) {
            anyhow::bail!("label patterns must not be empty");
        }
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be > 0");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be > 0");
        }
        if self.request_timeout.is_zero() {
            anyhow::bail!("request_timeout must be > 0");
        }
        if self.deadline.is_some_and(|d| d.is_zero()) {
            anyhow::bail!("deadline must be > 0 when set");
        }
        Ok(())
    }

    /// Build the label rule set
    pub fn rules(&self) -> Result<LabelRules> {
        LabelRules::from_patterns(self.label_patterns.iter().cloned(), self.match_mode)
            .context("Invalid label patterns")
    }

    /// Reconciler settings derived from this configuration
    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            concurrency: self.concurrency,
            max_attempts: self.retry.max_attempts,
            retry_backoff: self.retry.backoff,
            request_timeout: self.request_timeout,
            dry_run: self.dry_run,
        }
    }
}

// Default value functions
fn default_label_patterns() -> Vec<String> {
    DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_concurrency() -> usize {
    10
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_page_size() -> u32 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> Duration {
    Duration::from_millis(200)
}
