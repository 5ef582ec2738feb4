//! CLI argument parsing for gpu-cleanup

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use gpu_cleanup_core::MatchMode;

/// How label patterns are compared with label keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MatchModeArg {
    /// Key contains the pattern
    Contains,
    /// Key starts with the pattern
    Prefix,
}

impl From<MatchModeArg> for MatchMode {
    fn from(arg: MatchModeArg) -> Self {
        match arg {
            MatchModeArg::Contains => MatchMode::Contains,
            MatchModeArg::Prefix => MatchMode::Prefix,
        }
    }
}

/// Summary output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// GPU Cleanup - removes GPU device-plugin discovery labels from every node
#[derive(Debug, Parser)]
#[command(name = "gpu-cleanup")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Optional YAML configuration file
    #[arg(short, long, env = "GPU_CLEANUP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Label key pattern to remove (repeatable, overrides config)
    #[arg(
        short = 'l',
        long = "label-pattern",
        env = "GPU_CLEANUP_LABEL_PATTERNS",
        value_delimiter = ','
    )]
    pub label_patterns: Vec<String>,

    /// Pattern matching mode
    #[arg(long, value_enum, env = "GPU_CLEANUP_MATCH_MODE")]
    pub match_mode: Option<MatchModeArg>,

    /// Number of nodes processed concurrently
    #[arg(long, env = "GPU_CLEANUP_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Update attempts per node before giving up
    #[arg(long, env = "GPU_CLEANUP_MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    /// Deadline for each API request (e.g. 30s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub request_timeout: Option<Duration>,

    /// Cancel the whole run after this long (e.g. 5m)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub deadline: Option<Duration>,

    /// Nodes fetched per list request
    #[arg(long)]
    pub page_size: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GPU_CLEANUP_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "GPU_CLEANUP_LOG_JSON")]
    pub log_json: bool,

    /// Dry run mode - report labels that would be removed without writing
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Summary output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Write Prometheus metrics to this file when the run completes
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
