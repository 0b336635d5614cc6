//! Stackgate Core Library
//!
//! Domain logic for the deployment pipeline orchestrator: the stage and run
//! state machine, the gate evaluator and finding parsers, the approval
//! gate, and the error taxonomy. Persistence lives in `stackgate-state`;
//! execution and orchestration in `stackgate-pipeline`.

pub mod approval;
pub mod domain;
pub mod gate;
pub mod obs;
pub mod parser;
pub mod telemetry;

pub use domain::{
    can_transition, ExecutionError, Finding, PipelineError, Result, Severity, Stage, TriggerEvent,
};

pub use approval::{submit_decision, ApprovalDecision, ApprovalRequest, ApprovalStatus};
pub use gate::{evaluate, PolicyRuleset, Suppression, Verdict};
pub use parser::{ExitStatusParser, FindingParser, JsonFindingsParser, ParserKind};

pub use obs::{
    emit_approval_decision, emit_lock_acquired, emit_lock_released, emit_reconcile,
    emit_run_finalized, emit_run_suspended, emit_run_triggered, emit_stage_finished,
    emit_stage_started, RunSpan,
};
pub use telemetry::init_tracing;

pub use stackgate_state::{
    ArtifactRef, ArtifactStore, ContentDigest, LockManager, LockRecord, RunEvent, RunId, RunRecord,
    RunState, RunStore, StackId, StageResultRecord, StageStatus,
};

/// Stackgate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
