//! Pipeline stage definitions.
//!
//! The pipeline is a fixed linear sequence with one optional fork at
//! Approval — not a general DAG. Each stage declares whether it gates the
//! run, whether it mutates shared state (and therefore needs the lock), and
//! which earlier stage's artifact it consumes.

use serde::{Deserialize, Serialize};
use stackgate_state::RunState;

/// A named step in the fixed pipeline sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Syntax/schema validation of the infrastructure definition
    Validate,

    /// Style and correctness linting
    Lint,

    /// Security policy scan over the proposed change
    SecurityScan,

    /// Change preview via the external planner; produces the plan artifact
    Plan,

    /// Human approval suspension point (optional per configuration)
    Approval,

    /// Irreversible apply against shared infrastructure state
    Apply,
}

impl Stage {
    /// The fixed execution order. Approval participates only when enabled
    /// in the pipeline configuration.
    pub fn sequence() -> [Stage; 6] {
        [
            Stage::Validate,
            Stage::Lint,
            Stage::SecurityScan,
            Stage::Plan,
            Stage::Approval,
            Stage::Apply,
        ]
    }

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Lint => "lint",
            Stage::SecurityScan => "security_scan",
            Stage::Plan => "plan",
            Stage::Approval => "approval",
            Stage::Apply => "apply",
        }
    }

    /// Parse a stage name.
    pub fn from_name(name: &str) -> Option<Stage> {
        match name {
            "validate" => Some(Stage::Validate),
            "lint" => Some(Stage::Lint),
            "security_scan" => Some(Stage::SecurityScan),
            "plan" => Some(Stage::Plan),
            "approval" => Some(Stage::Approval),
            "apply" => Some(Stage::Apply),
            _ => None,
        }
    }

    /// Whether this stage mutates shared infrastructure state and must hold
    /// the stack lock while executing.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Stage::Apply)
    }

    /// Whether an external tool runs for this stage. Approval is a
    /// suspension point, not a tool invocation.
    pub fn runs_tool(&self) -> bool {
        !matches!(self, Stage::Approval)
    }

    /// The run state a run is in while this stage executes.
    pub fn run_state(&self) -> RunState {
        match self {
            Stage::Validate => RunState::Validating,
            Stage::Lint => RunState::Linting,
            Stage::SecurityScan => RunState::ScanningSecurity,
            Stage::Plan => RunState::Planning,
            Stage::Approval => RunState::AwaitingApproval,
            Stage::Apply => RunState::Applying,
        }
    }

    /// Which earlier stage's artifact this stage consumes as input.
    pub fn input_artifact_from(&self) -> Option<Stage> {
        match self {
            Stage::Apply => Some(Stage::Plan),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names_roundtrip() {
        for stage in Stage::sequence() {
            assert_eq!(Stage::from_name(stage.name()), Some(stage));
        }
        assert_eq!(Stage::from_name("bogus"), None);
    }

    #[test]
    fn test_only_apply_mutates() {
        for stage in Stage::sequence() {
            assert_eq!(stage.is_mutating(), stage == Stage::Apply);
        }
    }

    #[test]
    fn test_approval_runs_no_tool() {
        assert!(!Stage::Approval.runs_tool());
        assert!(Stage::Validate.runs_tool());
        assert!(Stage::Apply.runs_tool());
    }

    #[test]
    fn test_sequence_order() {
        let seq = Stage::sequence();
        assert_eq!(seq.first(), Some(&Stage::Validate));
        assert_eq!(seq.last(), Some(&Stage::Apply));
    }

    #[test]
    fn test_apply_consumes_plan_artifact() {
        assert_eq!(Stage::Apply.input_artifact_from(), Some(Stage::Plan));
        assert_eq!(Stage::Plan.input_artifact_from(), None);
    }

    #[test]
    fn test_run_state_mapping() {
        assert_eq!(Stage::Validate.run_state(), RunState::Validating);
        assert_eq!(Stage::Approval.run_state(), RunState::AwaitingApproval);
        assert_eq!(Stage::Apply.run_state(), RunState::Applying);
    }
}
