//! Pipeline configuration.
//!
//! Stage tool commands, timeouts, gating flags, parsers, and rulesets come
//! from configuration, not code. A malformed configuration fails the run
//! immediately as `PipelineError::Configuration` — it is an operator
//! mistake, not an infrastructure condition.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::executor::RetryPolicy;
use stackgate_core::domain::{PipelineError, Result, Stage};
use stackgate_core::gate::PolicyRuleset;
use stackgate_core::parser::ParserKind;

/// Behavior when the stack lock is already held at the Apply boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum LockWaitMode {
    /// Surface `AlreadyLocked` immediately.
    FailFast,
    /// Poll for the lock up to `timeout_secs`, then fail with
    /// `AlreadyLocked`.
    Queue { timeout_secs: u64, poll_ms: u64 },
}

/// Per-stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSettings {
    /// Tool argv; first element is the executable. May be empty when the
    /// adapter is injected programmatically (tests).
    pub command: Vec<String>,
    /// Wall-clock timeout for one invocation.
    pub timeout_secs: u64,
    /// Whether a Failed verdict halts the run. Apply is always gating.
    pub gating: bool,
    /// How this stage's raw output is parsed into findings.
    pub parser: ParserKind,
    /// Suppression rules for this stage's gate.
    pub ruleset: PolicyRuleset,
}

impl StageSettings {
    /// Settings for a tool whose findings come as the JSON document form.
    pub fn json_tool(command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            command,
            timeout_secs,
            gating: true,
            parser: ParserKind::JsonFindings,
            ruleset: PolicyRuleset::strict(),
        }
    }

    /// Settings for a tool that reports only via exit status.
    pub fn exit_status_tool(command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            command,
            timeout_secs,
            gating: true,
            parser: ParserKind::ExitStatus,
            ruleset: PolicyRuleset::strict(),
        }
    }

    /// Record findings without halting the run on failure.
    pub fn advisory(mut self) -> Self {
        self.gating = false;
        self
    }

    pub fn with_ruleset(mut self, ruleset: PolicyRuleset) -> Self {
        self.ruleset = ruleset;
        self
    }
}

/// Approval fork settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSettings {
    /// Whether the run parks for approval between Plan and Apply.
    pub required: bool,
    /// Deadline for the decision; `None` waits indefinitely.
    pub timeout_secs: Option<u64>,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            required: false,
            timeout_secs: None,
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Settings per tool stage (Approval has none — it runs no tool).
    pub stages: HashMap<Stage, StageSettings>,
    pub approval: ApprovalSettings,
    /// Lock lease duration for the Apply stage. Size generously relative
    /// to expected apply duration; the lease is renewed between attempts.
    pub lease_secs: u64,
    pub lock_wait: LockWaitMode,
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    /// Structural validation shared by all construction paths.
    pub fn validate(&self) -> Result<()> {
        if self.lease_secs == 0 {
            return Err(PipelineError::Configuration(
                "lease_secs must be nonzero".into(),
            ));
        }
        if let LockWaitMode::Queue { poll_ms, .. } = &self.lock_wait {
            if *poll_ms == 0 {
                return Err(PipelineError::Configuration(
                    "lock queue poll_ms must be nonzero".into(),
                ));
            }
        }
        for stage in Stage::sequence() {
            if !stage.runs_tool() {
                continue;
            }
            let settings = self.stages.get(&stage).ok_or_else(|| {
                PipelineError::Configuration(format!("no settings for stage {stage}"))
            })?;
            if settings.timeout_secs == 0 {
                return Err(PipelineError::Configuration(format!(
                    "stage {stage} timeout must be nonzero"
                )));
            }
            if stage.is_mutating() && !settings.gating {
                return Err(PipelineError::Configuration(
                    "apply stage cannot be advisory".into(),
                ));
            }
        }
        Ok(())
    }

    /// Additional validation for command-backed adapters: every tool stage
    /// needs a non-empty argv.
    pub fn validate_commands(&self) -> Result<()> {
        self.validate()?;
        for stage in Stage::sequence() {
            if !stage.runs_tool() {
                continue;
            }
            if self
                .stages
                .get(&stage)
                .map(|s| s.command.is_empty())
                .unwrap_or(true)
            {
                return Err(PipelineError::Configuration(format!(
                    "stage {stage} has an empty command"
                )));
            }
        }
        Ok(())
    }
}
