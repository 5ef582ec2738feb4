//! GPU discovery label matching
//!
//! Decides which node label keys were written by the GPU device plugin or
//! node-feature-discovery and have to go.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::Labels;

/// Default key patterns removed by the cleanup
pub const DEFAULT_PATTERNS: &[&str] = &["nvidia.com/gpu.deploy", "nvidia.com/gpu.present"];

/// How a pattern is compared against a label key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Key contains the pattern anywhere
    #[default]
    Contains,
    /// Key starts with the pattern
    Prefix,
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::Contains => write!(f, "contains"),
            MatchMode::Prefix => write!(f, "prefix"),
        }
    }
}

/// Errors building a rule set
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    /// An empty pattern would match every key
    #[error("label pattern must not be empty")]
    EmptyPattern,

    /// No patterns at all
    #[error("at least one label pattern is required")]
    NoPatterns,
}

/// A single key pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRule {
    pub pattern: String,
    #[serde(default)]
    pub mode: MatchMode,
}

impl LabelRule {
    /// Case-sensitive substring rule
    pub fn contains(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            mode: MatchMode::Contains,
        }
    }

    /// Case-sensitive prefix rule
    pub fn prefix(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            mode: MatchMode::Prefix,
        }
    }

    /// Check a label key against this rule
    pub fn matches(&self, key: &str) -> bool {
        match self.mode {
            MatchMode::Contains => key.contains(self.pattern.as_str()),
            MatchMode::Prefix => key.starts_with(self.pattern.as_str()),
        }
    }
}

impl fmt::Display for LabelRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mode, self.pattern)
    }
}

/// Ordered, immutable set of label rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRules {
    rules: Vec<LabelRule>,
}

impl LabelRules {
    /// Build a rule set, rejecting empty patterns
    pub fn new(rules: Vec<LabelRule>) -> Result<Self, RuleError> {
        if rules.is_empty() {
            return Err(RuleError::NoPatterns);
        }
        if rules.iter().any(|r| r.pattern.is_empty()) {
            return Err(RuleError::EmptyPattern);
        }
        Ok(Self { rules })
    }

    /// Build a rule set where every pattern uses `mode`
    pub fn from_patterns<I, S>(patterns: I, mode: MatchMode) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            patterns
                .into_iter()
                .map(|p| LabelRule {
                    pattern: p.into(),
                    mode,
                })
                .collect(),
        )
    }

    pub fn rules(&self) -> &[LabelRule] {
        &self.rules
    }

    /// Whether any rule matches `key`
    pub fn matches(&self, key: &str) -> bool {
        self.rules.iter().any(|r| r.matches(key))
    }

    /// Split `labels` into kept and dropped keys
    ///
    /// Pure: the input is left untouched and the same input always yields
    /// the same output.
    pub fn filter(&self, labels: &Labels) -> FilterOutcome {
        let mut remaining = Labels::new();
        let mut removed = Vec::new();

        for (key, value) in labels {
            if self.matches(key) {
                removed.push(key.clone());
            } else {
                remaining.insert(key.clone(), value.clone());
            }
        }

        FilterOutcome { remaining, removed }
    }
}

impl Default for LabelRules {
    fn default() -> Self {
        Self {
            rules: DEFAULT_PATTERNS
                .iter()
                .map(|p| LabelRule::contains(*p))
                .collect(),
        }
    }
}

/// Result of filtering one label mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Labels that survive the filter, values unchanged
    pub remaining: Labels,
    /// Dropped keys, in key order
    pub removed: Vec<String>,
}

impl FilterOutcome {
    /// At least one key was dropped
    pub fn changed(&self) -> bool {
        !self.removed.is_empty()
    }
}

/// Filter `labels` with `rules`
pub fn filter(labels: &Labels, rules: &LabelRules) -> FilterOutcome {
    rules.filter(labels)
}
