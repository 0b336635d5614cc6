//! Domain-level error taxonomy for Stackgate.

use serde::{Deserialize, Serialize};

use super::stage::Stage;
use stackgate_state::RunState;

/// Infrastructure-level failure of a tool invocation — distinct from a
/// tool-reported (gate) failure. Retried per engine policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExecutionError {
    #[error("tool timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("failed to spawn tool: {message}")]
    Spawn { message: String },

    #[error("io error during execution: {message}")]
    Io { message: String },
}

impl ExecutionError {
    /// Stable classification string recorded on stage results.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Spawn { .. } => "spawn",
            Self::Io { .. } => "io",
        }
    }
}

/// Stackgate pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Policy violation at a gating stage. Recorded, halts the run,
    /// never retried automatically.
    #[error("gate failure in stage {stage}: {blocking} blocking finding(s)")]
    Gate { stage: Stage, blocking: usize },

    /// Transient tool/infra failure that exhausted its retries.
    #[error("stage {stage} failed after {attempts} attempt(s): {source}")]
    Execution {
        stage: Stage,
        attempts: u32,
        source: ExecutionError,
    },

    /// An unexpired lease on the stack is held by another run.
    /// Fatal to this attempt; never silently retried.
    #[error("stack {stack_id} is locked by run {holder}")]
    AlreadyLocked { stack_id: String, holder: String },

    /// The fencing token this run holds was superseded in the registry —
    /// the lease was reclaimed after expiry. No mutation is performed.
    #[error(
        "lock fenced for stack {stack_id}: held token {held_token}, registry has {registry_token}"
    )]
    LockFenced {
        stack_id: String,
        held_token: u64,
        registry_token: u64,
    },

    /// The approval window elapsed without a decision.
    #[error("approval expired for run {run_id}")]
    ApprovalExpired { run_id: String },

    /// A reviewer rejected the change.
    #[error("approval rejected by {actor}: {reason}")]
    ApprovalRejected { actor: String, reason: String },

    /// Malformed ruleset, adapter config, or tool output schema — an
    /// operator mistake, surfaced distinctly and never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Persistence-layer failure.
    #[error("storage error: {0}")]
    Storage(#[from] stackgate_state::StorageError),

    /// The run's recorded state does not permit the requested transition.
    #[error("invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("run not found: {0}")]
    RunNotFound(String),
}

impl PipelineError {
    /// Stable classification string for records and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Gate { .. } => "gate_failure",
            Self::Execution { .. } => "execution_error",
            Self::AlreadyLocked { .. } => "already_locked",
            Self::LockFenced { .. } => "lock_fenced",
            Self::ApprovalExpired { .. } => "approval_expired",
            Self::ApprovalRejected { .. } => "approval_rejected",
            Self::Configuration(_) => "configuration_error",
            Self::Storage(_) => "storage_error",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::RunNotFound(_) => "run_not_found",
        }
    }
}

/// Result type for Stackgate domain operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
