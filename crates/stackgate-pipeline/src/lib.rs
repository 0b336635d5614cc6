//! Stackgate Pipeline - execution engine for the deployment pipeline
//!
//! Provides the orchestrator that:
//! - Drives a run through Validate → Lint → SecurityScan → Plan →
//!   optional Approval → Apply
//! - Executes stage tools through pluggable adapters with bounded timeouts
//!   and retried transient failures
//! - Serializes Apply through the fenced stack lock
//! - Records every attempt, event, and artifact for audit

pub mod adapter;
pub mod config;
pub mod engine;
pub mod executor;

// Re-export key types
pub use adapter::{AdapterContext, CommandAdapter, ExecutionOutcome, InputArtifact, ToolAdapter};
pub use config::{ApprovalSettings, LockWaitMode, PipelineConfig, StageSettings};
pub use engine::{NoopProbe, PipelineEngine, ProbeVerdict, ReconcileProbe};
pub use executor::{execute_with_retries, AttemptOutcome, ExecutionReport, RetryPolicy};
