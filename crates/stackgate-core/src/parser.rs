//! Per-tool output parsing behind a single seam.
//!
//! Each external tool's output grammar is isolated behind [`FindingParser`];
//! the gate evaluator depends only on the abstract [`Finding`] shape, never
//! on a specific tool's format. Malformed output is a configuration error
//! (wrong adapter wired to the stage), not a gate failure.

use serde::{Deserialize, Serialize};

use crate::domain::error::{PipelineError, Result};
use crate::domain::finding::Finding;
use crate::domain::stage::Stage;

/// Parses one tool's raw output into the tool-agnostic finding list.
pub trait FindingParser: Send + Sync {
    fn parse_findings(&self, stage: Stage, raw: &str) -> Result<Vec<Finding>>;
}

/// Which parser a stage's adapter output runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserKind {
    /// Tool emits a JSON array of findings (or `{"findings": [...]}`)
    JsonFindings,
    /// Tool reports only via exit status; output carries no findings
    ExitStatus,
}

impl ParserKind {
    pub fn build(&self) -> Box<dyn FindingParser> {
        match self {
            ParserKind::JsonFindings => Box::new(JsonFindingsParser),
            ParserKind::ExitStatus => Box::new(ExitStatusParser),
        }
    }
}

/// Parser for the tool-agnostic JSON findings form.
///
/// Accepts either a bare array of findings or an object with a `findings`
/// key, which covers the scanners that wrap their report in a summary
/// envelope. Empty output means no findings.
pub struct JsonFindingsParser;

#[derive(Deserialize)]
struct FindingsEnvelope {
    findings: Vec<Finding>,
}

impl FindingParser for JsonFindingsParser {
    fn parse_findings(&self, stage: Stage, raw: &str) -> Result<Vec<Finding>> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        if let Ok(findings) = serde_json::from_str::<Vec<Finding>>(trimmed) {
            return Ok(findings);
        }
        if let Ok(envelope) = serde_json::from_str::<FindingsEnvelope>(trimmed) {
            return Ok(envelope.findings);
        }

        Err(PipelineError::Configuration(format!(
            "stage {stage}: tool output is not a findings document"
        )))
    }
}

/// Parser for tools that report only via exit status.
pub struct ExitStatusParser;

impl FindingParser for ExitStatusParser {
    fn parse_findings(&self, _stage: Stage, _raw: &str) -> Result<Vec<Finding>> {
        Ok(Vec::new())
    }
}
