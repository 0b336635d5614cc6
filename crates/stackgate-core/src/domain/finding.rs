//! Structured findings surfaced by policy gates.

use serde::{Deserialize, Serialize};

/// Severity of a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    /// Blocks the run at a gating stage.
    Blocking,
}

/// One policy violation or warning surfaced by a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Identifier of the violated rule (e.g. "S3_BUCKET_ENCRYPTION")
    pub rule_id: String,
    pub severity: Severity,
    /// Reference to the offending resource in the infrastructure definition
    pub resource: String,
    /// Human-readable message
    pub message: String,
    /// Set when a suppression downgraded this finding from Blocking
    #[serde(default)]
    pub suppressed: bool,
}

impl Finding {
    pub fn new(
        rule_id: impl Into<String>,
        severity: Severity,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            severity,
            resource: resource.into(),
            message: message.into(),
            suppressed: false,
        }
    }

    /// Whether this finding blocks a gating stage.
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}
