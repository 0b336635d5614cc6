//! Pipeline engine — the state machine driving a run from trigger to
//! terminal state.
//!
//! Enforces stage ordering through the explicit transition table, halts
//! before Apply on any gate violation, serializes mutation through the
//! lease-based lock with a fencing re-check, parks runs awaiting approval
//! as persisted state (no worker blocked), and reconciles runs left in
//! `Applying` after a crash.
//!
//! The engine holds no in-process state of its own, so multiple replicas
//! may drive disjoint runs against the same stores.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::warn;

use crate::adapter::{AdapterContext, CommandAdapter, InputArtifact, ToolAdapter};
use crate::config::{LockWaitMode, PipelineConfig};
use crate::executor::execute_with_retries;
use stackgate_core::approval::{submit_decision, ApprovalDecision, ApprovalRequest};
use stackgate_core::domain::{
    can_transition, Finding, PipelineError, Result, Severity, Stage, TriggerEvent,
};
use stackgate_core::{gate, obs};
use stackgate_state::{
    ArtifactRef, ArtifactStore, LockManager, RunEvent, RunId, RunMetadata, RunRecord, RunState,
    RunStore, RunSummary, StageResultRecord, StageStatus, StorageError,
};

/// Answer from the external state's own consistency check, used when
/// reconciling a run that crashed mid-apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The mutation verifiably landed.
    Applied,
    /// The mutation verifiably did not land; a re-trigger is safe.
    NotApplied,
    /// Cannot tell — treated as not-applied for reporting, never as success.
    Unknown,
}

impl ProbeVerdict {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::NotApplied => "not_applied",
            Self::Unknown => "unknown",
        }
    }
}

/// External consistency check consulted during crash reconciliation.
#[async_trait::async_trait]
pub trait ReconcileProbe: Send + Sync {
    async fn verify(&self, run: &RunRecord) -> ProbeVerdict;
}

/// Probe that cannot verify anything. Reconciliation with this probe never
/// reports success for an interrupted apply.
pub struct NoopProbe;

#[async_trait::async_trait]
impl ReconcileProbe for NoopProbe {
    async fn verify(&self, _run: &RunRecord) -> ProbeVerdict {
        ProbeVerdict::Unknown
    }
}

/// How one tool stage ended, from the engine's point of view.
enum StageDisposition {
    Passed,
    /// Failed, but the stage is advisory — findings recorded, run continues.
    Advisory,
    GateFailed {
        blocking: usize,
    },
    ExecutionFailed {
        attempts: u32,
        source: stackgate_core::domain::ExecutionError,
    },
    ConfigFailed {
        message: String,
    },
}

/// The pipeline execution engine.
pub struct PipelineEngine {
    runs: Arc<dyn RunStore>,
    locks: Arc<dyn LockManager>,
    artifacts: Arc<dyn ArtifactStore>,
    adapters: HashMap<Stage, Arc<dyn ToolAdapter>>,
    config: PipelineConfig,
}

impl PipelineEngine {
    /// Build an engine with explicitly injected adapters (tests, embedders).
    pub fn new(
        runs: Arc<dyn RunStore>,
        locks: Arc<dyn LockManager>,
        artifacts: Arc<dyn ArtifactStore>,
        adapters: HashMap<Stage, Arc<dyn ToolAdapter>>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        for stage in Stage::sequence() {
            if stage.runs_tool() && !adapters.contains_key(&stage) {
                return Err(PipelineError::Configuration(format!(
                    "no adapter for stage {stage}"
                )));
            }
        }
        Ok(Self {
            runs,
            locks,
            artifacts,
            adapters,
            config,
        })
    }

    /// Build an engine whose adapters run the configured commands as
    /// subprocesses.
    pub fn from_config(
        runs: Arc<dyn RunStore>,
        locks: Arc<dyn LockManager>,
        artifacts: Arc<dyn ArtifactStore>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate_commands()?;
        let mut adapters: HashMap<Stage, Arc<dyn ToolAdapter>> = HashMap::new();
        for stage in Stage::sequence() {
            if !stage.runs_tool() {
                continue;
            }
            let settings = Self::config_stage(&config, stage)?;
            adapters.insert(
                stage,
                Arc::new(CommandAdapter::new(
                    settings.command.clone(),
                    settings.timeout_secs,
                )),
            );
        }
        Self::new(runs, locks, artifacts, adapters, config)
    }

    fn config_stage<'a>(
        config: &'a PipelineConfig,
        stage: Stage,
    ) -> Result<&'a crate::config::StageSettings> {
        config
            .stages
            .get(&stage)
            .ok_or_else(|| PipelineError::Configuration(format!("no settings for stage {stage}")))
    }

    /// The stages this configuration runs, in order.
    fn pipeline_stages(&self) -> Vec<Stage> {
        let mut stages = vec![Stage::Validate, Stage::Lint, Stage::SecurityScan, Stage::Plan];
        if self.config.approval.required {
            stages.push(Stage::Approval);
        }
        stages.push(Stage::Apply);
        stages
    }

    // -- public operations ---------------------------------------------------

    /// Create a run for a trigger event. The run starts in `Created`;
    /// `execute` drives it.
    pub async fn trigger(&self, event: TriggerEvent) -> Result<RunId> {
        let run_id = self
            .runs
            .create_run(
                &event.stack_id,
                &event.revision,
                RunMetadata {
                    triggered_by: event.triggered_by.clone(),
                    tags: event.tags.clone(),
                },
            )
            .await?;

        obs::emit_run_triggered(&run_id.0, &event.stack_id.0, &event.revision);
        self.record_event(
            &run_id,
            "run.triggered",
            json!({
                "stack_id": event.stack_id.0,
                "revision": event.revision,
                "triggered_by": event.triggered_by,
            }),
        )
        .await?;

        Ok(run_id)
    }

    /// Drive a freshly triggered run until it reaches a terminal state or
    /// parks in `AwaitingApproval`.
    pub async fn execute(&self, run_id: &RunId) -> Result<RunRecord> {
        let run = self.runs.get_run(run_id).await?;
        if run.state != RunState::Created {
            return Err(PipelineError::InvalidTransition {
                from: run.state,
                to: RunState::Validating,
            });
        }
        let _span = obs::RunSpan::enter(&run_id.0, &run.stack_id.0);

        for stage in [Stage::Validate, Stage::Lint, Stage::SecurityScan, Stage::Plan] {
            if self.runs.get_run(run_id).await?.cancel_requested {
                return self.abort_run(run_id, "cancelled by operator").await;
            }

            self.transition(run_id, stage.run_state()).await?;

            match self.run_tool_stage(&run, stage).await? {
                StageDisposition::Passed | StageDisposition::Advisory => {}
                StageDisposition::GateFailed { blocking } => {
                    return self
                        .fail_run(run_id, PipelineError::Gate { stage, blocking })
                        .await;
                }
                StageDisposition::ExecutionFailed { attempts, source } => {
                    return self
                        .fail_run(
                            run_id,
                            PipelineError::Execution {
                                stage,
                                attempts,
                                source,
                            },
                        )
                        .await;
                }
                StageDisposition::ConfigFailed { message } => {
                    return self
                        .fail_run(run_id, PipelineError::Configuration(message))
                        .await;
                }
            }
        }

        if self.config.approval.required {
            return self.park_for_approval(run_id).await;
        }
        self.run_apply(run_id).await
    }

    /// Apply an external approval decision to a parked run and re-enter the
    /// state machine.
    ///
    /// Approve proceeds into Apply; Reject aborts the run; a decision
    /// arriving after the approval deadline aborts the run and returns
    /// `ApprovalExpired`.
    pub async fn submit_approval(
        &self,
        run_id: &RunId,
        decision: ApprovalDecision,
        actor: &str,
    ) -> Result<RunRecord> {
        let run = self.runs.get_run(run_id).await?;
        if run.state != RunState::AwaitingApproval {
            return Err(PipelineError::InvalidTransition {
                from: run.state,
                to: RunState::Applying,
            });
        }
        let _span = obs::RunSpan::enter(&run_id.0, &run.stack_id.0);

        let suspended_at = run.suspended_at.unwrap_or(run.created_at);
        let mut request = ApprovalRequest::new(
            run_id.clone(),
            run.stack_id.clone(),
            self.config.approval.timeout_secs,
            suspended_at,
        );

        let now = Utc::now();
        match submit_decision(&mut request, decision, actor, now) {
            Ok(()) => {
                obs::emit_approval_decision(&run_id.0, actor, true);
                self.record_event(
                    run_id,
                    "approval.decided",
                    json!({"actor": actor, "approved": true}),
                )
                .await?;
                self.append_approval_result(run_id, StageStatus::Passed, None, suspended_at)
                    .await?;
                self.runs.set_suspended_at(run_id, None).await?;
                self.run_apply(run_id).await
            }
            Err(PipelineError::ApprovalRejected { actor, reason }) => {
                obs::emit_approval_decision(&run_id.0, &actor, false);
                self.record_event(
                    run_id,
                    "approval.decided",
                    json!({"actor": actor, "approved": false, "reason": reason}),
                )
                .await?;
                self.append_approval_result(
                    run_id,
                    StageStatus::Failed,
                    Some("approval_rejected"),
                    suspended_at,
                )
                .await?;
                self.abort_run(run_id, &format!("rejected by {actor}: {reason}"))
                    .await
            }
            Err(err @ PipelineError::ApprovalExpired { .. }) => {
                self.record_event(run_id, "approval.expired", json!({"actor": actor}))
                    .await?;
                self.append_approval_result(
                    run_id,
                    StageStatus::Failed,
                    Some("approval_expired"),
                    suspended_at,
                )
                .await?;
                self.abort_run(run_id, "approval expired").await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Request cancellation.
    ///
    /// Parked runs (`Created`, `AwaitingApproval`) abort immediately. A run
    /// in `Applying` only gets the flag set — the in-flight mutation
    /// completes before the request is honored. Anything else mid-pipeline
    /// gets the flag and aborts at the next stage boundary.
    pub async fn cancel(&self, run_id: &RunId) -> Result<RunRecord> {
        let run = self.runs.get_run(run_id).await?;
        if run.state.is_terminal() {
            return Err(PipelineError::InvalidTransition {
                from: run.state,
                to: RunState::Aborted,
            });
        }

        self.runs.request_cancel(run_id).await?;

        match run.state {
            RunState::Created | RunState::AwaitingApproval => {
                self.abort_run(run_id, "cancelled by operator").await
            }
            _ => {
                self.record_event(run_id, "run.cancel_requested", json!({"state": run.state}))
                    .await?;
                self.runs.get_run(run_id).await.map_err(Into::into)
            }
        }
    }

    /// Abort parked runs whose approval deadline has passed. Returns the
    /// runs reaped.
    pub async fn reap_expired_approvals(&self, now: DateTime<Utc>) -> Result<Vec<RunId>> {
        let Some(timeout_secs) = self.config.approval.timeout_secs else {
            return Ok(Vec::new());
        };

        let mut reaped = Vec::new();
        for run in self.runs.list_runs_in_state(RunState::AwaitingApproval).await? {
            let suspended_at = run.suspended_at.unwrap_or(run.created_at);
            if now < suspended_at + Duration::seconds(timeout_secs as i64) {
                continue;
            }
            self.record_event(&run.run_id, "approval.expired", json!({"reaped": true}))
                .await?;
            self.append_approval_result(
                &run.run_id,
                StageStatus::Failed,
                Some("approval_expired"),
                suspended_at,
            )
            .await?;
            self.abort_run(&run.run_id, "approval expired").await?;
            reaped.push(run.run_id);
        }
        Ok(reaped)
    }

    /// Reconcile runs left in `Applying` by a crashed engine.
    ///
    /// Lease expiry is the sole lock recovery mechanism: a run whose lease
    /// is still live is skipped (another replica may legitimately be
    /// applying). For the rest, the external probe decides — `Succeeded` is
    /// only ever reported when the probe confirms the mutation landed.
    pub async fn reconcile(&self, probe: &dyn ReconcileProbe) -> Result<Vec<RunId>> {
        let now = Utc::now();
        let mut reconciled = Vec::new();

        for run in self.runs.list_runs_in_state(RunState::Applying).await? {
            if let Some(lease) = self.locks.inspect(&run.stack_id, now).await? {
                if lease.holder == run.run_id {
                    continue;
                }
            }

            let verdict = probe.verify(&run).await;
            obs::emit_reconcile(&run.run_id.0, verdict.as_str());
            self.record_event(
                &run.run_id,
                "run.reconciled",
                json!({"verdict": verdict.as_str()}),
            )
            .await?;
            self.runs.set_lock_token(&run.run_id, None).await?;

            let attempt = self.next_attempt(&run.run_id, Stage::Apply).await?;
            let (status, error_kind, success) = match verdict {
                ProbeVerdict::Applied => (StageStatus::Passed, "reconcile_confirmed", true),
                ProbeVerdict::NotApplied => (StageStatus::Failed, "reconcile_not_applied", false),
                ProbeVerdict::Unknown => (StageStatus::Failed, "reconcile_unverified", false),
            };
            self.runs
                .append_stage_result(
                    &run.run_id,
                    StageResultRecord {
                        stage: Stage::Apply.name().to_string(),
                        attempt,
                        status,
                        exit_code: None,
                        output_digest: None,
                        findings: json!([]),
                        error_kind: Some(error_kind.to_string()),
                        started_at: now,
                        finished_at: Some(now),
                    },
                )
                .await?;

            let state = if success {
                RunState::Succeeded
            } else {
                RunState::Failed
            };
            self.finalize(&run.run_id, state).await?;
            reconciled.push(run.run_id);
        }
        Ok(reconciled)
    }

    // -- stage execution -----------------------------------------------------

    /// Execute one tool stage: run the adapter with retries, persist every
    /// attempt, store the raw output as an artifact, parse findings, and
    /// evaluate the gate.
    async fn run_tool_stage(&self, run: &RunRecord, stage: Stage) -> Result<StageDisposition> {
        let run_id = &run.run_id;
        let settings = Self::config_stage(&self.config, stage)?;
        let adapter = self
            .adapters
            .get(&stage)
            .ok_or_else(|| PipelineError::Configuration(format!("no adapter for stage {stage}")))?
            .clone();

        let inputs = self.collect_inputs(run_id, stage).await?;
        let base_attempt = self.next_attempt(run_id, stage).await? - 1;
        let ctx = AdapterContext {
            run_id: run_id.clone(),
            stack_id: run.stack_id.clone(),
            stage,
            attempt: base_attempt + 1,
            revision: run.revision.clone(),
            inputs,
        };

        obs::emit_stage_started(&run_id.0, stage, ctx.attempt);
        self.record_event(run_id, "stage.started", json!({"stage": stage.name()}))
            .await?;

        let report = execute_with_retries(adapter.as_ref(), &ctx, &self.config.retry).await;

        // Every non-final attempt ended in an execution error and was
        // retried; each gets its own append-only record.
        for attempt in &report.attempts[..report.attempts.len() - 1] {
            let err = attempt.result.as_ref().err().expect("retried attempts are errors");
            self.runs
                .append_stage_result(
                    run_id,
                    StageResultRecord {
                        stage: stage.name().to_string(),
                        attempt: base_attempt + attempt.attempt,
                        status: StageStatus::Failed,
                        exit_code: None,
                        output_digest: None,
                        findings: json!([]),
                        error_kind: Some(err.kind().to_string()),
                        started_at: attempt.started_at,
                        finished_at: Some(attempt.finished_at),
                    },
                )
                .await?;
            self.record_event(
                run_id,
                "stage.retry",
                json!({"stage": stage.name(), "attempt": base_attempt + attempt.attempt, "error": err.to_string()}),
            )
            .await?;
        }

        let final_attempt = report.final_attempt();
        let attempt_no = base_attempt + final_attempt.attempt;

        let outcome = match &final_attempt.result {
            Err(err) => {
                self.runs
                    .append_stage_result(
                        run_id,
                        StageResultRecord {
                            stage: stage.name().to_string(),
                            attempt: attempt_no,
                            status: StageStatus::Failed,
                            exit_code: None,
                            output_digest: None,
                            findings: json!([]),
                            error_kind: Some(err.kind().to_string()),
                            started_at: final_attempt.started_at,
                            finished_at: Some(final_attempt.finished_at),
                        },
                    )
                    .await?;
                obs::emit_stage_finished(&run_id.0, stage, StageStatus::Failed, 0);
                self.record_event(
                    run_id,
                    "stage.failed",
                    json!({"stage": stage.name(), "error_kind": err.kind(), "error": err.to_string()}),
                )
                .await?;
                return Ok(StageDisposition::ExecutionFailed {
                    attempts: final_attempt.attempt,
                    source: err.clone(),
                });
            }
            Ok(outcome) => outcome,
        };

        // The raw output is the stage's artifact — for Plan, the preview
        // that Apply later consumes.
        let artifact = self
            .artifacts
            .put(run_id, stage.name(), outcome.stdout.as_bytes())
            .await?;

        let findings = match settings
            .parser
            .build()
            .parse_findings(stage, &outcome.stdout)
        {
            Ok(findings) => findings,
            Err(PipelineError::Configuration(message)) => {
                self.runs
                    .append_stage_result(
                        run_id,
                        StageResultRecord {
                            stage: stage.name().to_string(),
                            attempt: attempt_no,
                            status: StageStatus::Failed,
                            exit_code: Some(outcome.exit_code),
                            output_digest: Some(artifact.digest.clone()),
                            findings: json!([]),
                            error_kind: Some("configuration".to_string()),
                            started_at: final_attempt.started_at,
                            finished_at: Some(final_attempt.finished_at),
                        },
                    )
                    .await?;
                self.record_event(
                    run_id,
                    "stage.failed",
                    json!({"stage": stage.name(), "error_kind": "configuration", "error": message}),
                )
                .await?;
                return Ok(StageDisposition::ConfigFailed { message });
            }
            Err(err) => return Err(err),
        };

        let mut verdict = gate::evaluate(stage, findings, &settings.ruleset);

        // A nonzero exit with no blocking finding still fails the gate;
        // attribute it so the record always explains the failure.
        if !outcome.succeeded() && verdict.blocking_count() == 0 {
            verdict.passed = false;
            verdict.findings.push(Finding::new(
                "TOOL_EXIT",
                Severity::Blocking,
                run.stack_id.0.clone(),
                format!("tool exited with code {}", outcome.exit_code),
            ));
        }

        let passed = outcome.succeeded() && verdict.passed;
        let status = if passed {
            StageStatus::Passed
        } else {
            StageStatus::Failed
        };
        let blocking = verdict.blocking_count();

        self.runs
            .append_stage_result(
                run_id,
                StageResultRecord {
                    stage: stage.name().to_string(),
                    attempt: attempt_no,
                    status,
                    exit_code: Some(outcome.exit_code),
                    output_digest: Some(artifact.digest.clone()),
                    findings: serde_json::to_value(&verdict.findings)
                        .map_err(StorageError::from)?,
                    error_kind: None,
                    started_at: final_attempt.started_at,
                    finished_at: Some(final_attempt.finished_at),
                },
            )
            .await?;

        obs::emit_stage_finished(&run_id.0, stage, status, verdict.findings.len());
        self.record_event(
            run_id,
            if passed { "stage.passed" } else { "stage.failed" },
            json!({
                "stage": stage.name(),
                "status": status.as_str(),
                "exit_code": outcome.exit_code,
                "findings": serde_json::to_value(&verdict.findings).map_err(StorageError::from)?,
            }),
        )
        .await?;

        if passed {
            Ok(StageDisposition::Passed)
        } else if !settings.gating && !stage.is_mutating() {
            Ok(StageDisposition::Advisory)
        } else {
            Ok(StageDisposition::GateFailed { blocking })
        }
    }

    /// Materialize the input artifacts a stage consumes (the plan preview,
    /// for Apply).
    async fn collect_inputs(&self, run_id: &RunId, stage: Stage) -> Result<Vec<InputArtifact>> {
        let Some(producer) = stage.input_artifact_from() else {
            return Ok(Vec::new());
        };

        let results = self.runs.stage_results(run_id).await?;
        let digest = results
            .iter()
            .rev()
            .find(|r| r.stage == producer.name() && r.status == StageStatus::Passed)
            .and_then(|r| r.output_digest.clone())
            .ok_or_else(|| {
                PipelineError::Storage(StorageError::ArtifactNotFound {
                    run_id: run_id.0.clone(),
                    stage: producer.name().to_string(),
                    digest: "<unrecorded>".to_string(),
                })
            })?;

        let bytes = self
            .artifacts
            .get(&ArtifactRef {
                run_id: run_id.clone(),
                stage: producer.name().to_string(),
                digest,
            })
            .await?;

        Ok(vec![InputArtifact {
            name: producer.name().to_string(),
            bytes,
        }])
    }

    // -- approval ------------------------------------------------------------

    async fn park_for_approval(&self, run_id: &RunId) -> Result<RunRecord> {
        let now = Utc::now();
        self.transition(run_id, RunState::AwaitingApproval).await?;
        self.runs.set_suspended_at(run_id, Some(now)).await?;

        let attempt = self.next_attempt(run_id, Stage::Approval).await?;
        self.runs
            .append_stage_result(
                run_id,
                StageResultRecord {
                    stage: Stage::Approval.name().to_string(),
                    attempt,
                    status: StageStatus::Suspended,
                    exit_code: None,
                    output_digest: None,
                    findings: json!([]),
                    error_kind: None,
                    started_at: now,
                    finished_at: None,
                },
            )
            .await?;

        let run = self.runs.get_run(run_id).await?;
        obs::emit_run_suspended(&run_id.0, &run.stack_id.0);
        self.record_event(run_id, "run.suspended", json!({"stack_id": run.stack_id.0}))
            .await?;
        Ok(self.runs.get_run(run_id).await?)
    }

    async fn append_approval_result(
        &self,
        run_id: &RunId,
        status: StageStatus,
        error_kind: Option<&str>,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let attempt = self.next_attempt(run_id, Stage::Approval).await?;
        self.runs
            .append_stage_result(
                run_id,
                StageResultRecord {
                    stage: Stage::Approval.name().to_string(),
                    attempt,
                    status,
                    exit_code: None,
                    output_digest: None,
                    findings: json!([]),
                    error_kind: error_kind.map(String::from),
                    started_at,
                    finished_at: Some(Utc::now()),
                },
            )
            .await?;
        Ok(())
    }

    // -- apply ---------------------------------------------------------------

    /// The mutating stage: acquire the lock, re-validate the fencing token,
    /// apply, and release the lock on success and failure alike.
    async fn run_apply(&self, run_id: &RunId) -> Result<RunRecord> {
        let run = self.runs.get_run(run_id).await?;

        if run.cancel_requested {
            return self.abort_run(run_id, "cancelled by operator").await;
        }

        let lease = Duration::seconds(self.config.lease_secs as i64);
        let token = match self.acquire_lock(&run, lease).await {
            Ok(token) => token,
            Err(err @ PipelineError::AlreadyLocked { .. }) => {
                self.record_event(
                    run_id,
                    "lock.conflict",
                    json!({"stack_id": run.stack_id.0, "error": err.to_string()}),
                )
                .await?;
                return self.fail_run(run_id, err).await;
            }
            Err(err) => return Err(err),
        };

        self.runs.set_lock_token(run_id, Some(token)).await?;
        obs::emit_lock_acquired(&run_id.0, &run.stack_id.0, token);
        self.record_event(
            run_id,
            "lock.acquired",
            json!({"stack_id": run.stack_id.0, "token": token}),
        )
        .await?;

        self.transition(run_id, RunState::Applying).await?;

        // Start the apply with a full lease window. A renewal failure here
        // is lock loss, not a warning: the lease was reclaimed and mutating
        // now would race the new holder.
        if let Err(renew_err) = self
            .locks
            .renew(&run.stack_id, token, lease, Utc::now())
            .await
        {
            let registry_token = self
                .locks
                .inspect(&run.stack_id, Utc::now())
                .await?
                .map(|r| r.token)
                .unwrap_or(0);
            warn!(run_id = %run_id, error = %renew_err, "lease renewal failed before apply");
            let err = PipelineError::LockFenced {
                stack_id: run.stack_id.0.clone(),
                held_token: token,
                registry_token,
            };
            self.record_event(
                run_id,
                "lock.fenced",
                json!({"held_token": token, "registry_token": registry_token}),
            )
            .await?;
            self.runs.set_lock_token(run_id, None).await?;
            return self.fail_run(run_id, err).await;
        }

        // Fencing re-check immediately before committing: if the registry
        // token moved on, our lease was reclaimed and mutating now would
        // race the new holder.
        match self.locks.inspect(&run.stack_id, Utc::now()).await? {
            Some(lease_record) if lease_record.token == token && lease_record.holder == *run_id => {
            }
            other => {
                let registry_token = other.map(|r| r.token).unwrap_or(0);
                let err = PipelineError::LockFenced {
                    stack_id: run.stack_id.0.clone(),
                    held_token: token,
                    registry_token,
                };
                self.record_event(
                    run_id,
                    "lock.fenced",
                    json!({"held_token": token, "registry_token": registry_token}),
                )
                .await?;
                self.runs.set_lock_token(run_id, None).await?;
                // The lease is no longer ours to release.
                return self.fail_run(run_id, err).await;
            }
        }

        let disposition = self.run_tool_stage(&run, Stage::Apply).await;

        // Release on success AND failure — the lock is never left held by a
        // live engine. A failed release is survivable: the lease expires.
        if let Err(release_err) = self.locks.release(&run.stack_id, token).await {
            warn!(
                run_id = %run_id,
                stack_id = %run.stack_id,
                error = %release_err,
                "lock release failed; lease expiry will recover"
            );
        }
        obs::emit_lock_released(&run_id.0, &run.stack_id.0, token);
        self.record_event(
            run_id,
            "lock.released",
            json!({"stack_id": run.stack_id.0, "token": token}),
        )
        .await?;
        self.runs.set_lock_token(run_id, None).await?;

        let disposition = disposition?;

        // A cancellation that landed during the apply is honored only now,
        // at the safe boundary: the outcome stands, the request is recorded.
        if self.runs.get_run(run_id).await?.cancel_requested {
            self.record_event(run_id, "run.cancel_late", json!({"honored": "after apply"}))
                .await?;
        }

        match disposition {
            StageDisposition::Passed => self.finalize(run_id, RunState::Succeeded).await,
            StageDisposition::Advisory => unreachable!("apply is always gating"),
            StageDisposition::GateFailed { blocking } => {
                self.fail_run(
                    run_id,
                    PipelineError::Gate {
                        stage: Stage::Apply,
                        blocking,
                    },
                )
                .await
            }
            StageDisposition::ExecutionFailed { attempts, source } => {
                self.fail_run(
                    run_id,
                    PipelineError::Execution {
                        stage: Stage::Apply,
                        attempts,
                        source,
                    },
                )
                .await
            }
            StageDisposition::ConfigFailed { message } => {
                self.fail_run(run_id, PipelineError::Configuration(message))
                    .await
            }
        }
    }

    async fn acquire_lock(&self, run: &RunRecord, lease: Duration) -> Result<u64> {
        match &self.config.lock_wait {
            LockWaitMode::FailFast => self
                .locks
                .acquire(&run.stack_id, &run.run_id, lease, Utc::now())
                .await
                .map_err(map_lock_error),
            LockWaitMode::Queue {
                timeout_secs,
                poll_ms,
            } => {
                let deadline = Utc::now() + Duration::seconds(*timeout_secs as i64);
                loop {
                    match self
                        .locks
                        .acquire(&run.stack_id, &run.run_id, lease, Utc::now())
                        .await
                    {
                        Ok(token) => return Ok(token),
                        Err(StorageError::LockHeld { .. }) if Utc::now() < deadline => {
                            tokio::time::sleep(std::time::Duration::from_millis(*poll_ms)).await;
                        }
                        Err(err) => return Err(map_lock_error(err)),
                    }
                }
            }
        }
    }

    // -- terminal transitions ------------------------------------------------

    async fn fail_run(&self, run_id: &RunId, error: PipelineError) -> Result<RunRecord> {
        warn!(run_id = %run_id, error = %error, kind = error.kind(), "run failed");
        self.record_event(
            run_id,
            "run.failed",
            json!({"error_kind": error.kind(), "error": error.to_string()}),
        )
        .await?;
        self.skip_unexecuted_stages(run_id).await?;
        self.finalize(run_id, RunState::Failed).await
    }

    async fn abort_run(&self, run_id: &RunId, reason: &str) -> Result<RunRecord> {
        self.record_event(run_id, "run.aborted", json!({"reason": reason}))
            .await?;
        self.skip_unexecuted_stages(run_id).await?;
        self.finalize(run_id, RunState::Aborted).await
    }

    /// Append Skipped records for every configured stage that never ran, so
    /// the audit record always accounts for the full sequence.
    async fn skip_unexecuted_stages(&self, run_id: &RunId) -> Result<()> {
        let results = self.runs.stage_results(run_id).await?;
        let now = Utc::now();
        for stage in self.pipeline_stages() {
            if results.iter().any(|r| r.stage == stage.name()) {
                continue;
            }
            self.runs
                .append_stage_result(
                    run_id,
                    StageResultRecord {
                        stage: stage.name().to_string(),
                        attempt: 1,
                        status: StageStatus::Skipped,
                        exit_code: None,
                        output_digest: None,
                        findings: json!([]),
                        error_kind: None,
                        started_at: now,
                        finished_at: Some(now),
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn finalize(&self, run_id: &RunId, state: RunState) -> Result<RunRecord> {
        let run = self.runs.get_run(run_id).await?;
        if !can_transition(run.state, state) {
            return Err(PipelineError::InvalidTransition {
                from: run.state,
                to: state,
            });
        }
        let results = self.runs.stage_results(run_id).await?;
        let duration_ms = (Utc::now() - run.created_at).num_milliseconds().max(0) as u64;
        let summary = RunSummary {
            stages_passed: results
                .iter()
                .filter(|r| r.status == StageStatus::Passed)
                .count() as u32,
            stages_failed: results
                .iter()
                .filter(|r| r.status == StageStatus::Failed)
                .count() as u32,
            duration_ms,
            success: state == RunState::Succeeded,
        };

        self.record_event(run_id, "run.finalized", json!({"state": state.as_str()}))
            .await?;
        self.runs.finalize_run(run_id, state, summary).await?;
        obs::emit_run_finalized(&run_id.0, state, duration_ms);
        Ok(self.runs.get_run(run_id).await?)
    }

    // -- bookkeeping ---------------------------------------------------------

    /// Guarded state transition: every edge the engine takes must be in the
    /// allowed-transition table.
    async fn transition(&self, run_id: &RunId, to: RunState) -> Result<()> {
        let from = self.runs.get_run(run_id).await?.state;
        if !can_transition(from, to) {
            return Err(PipelineError::InvalidTransition { from, to });
        }
        self.runs.transition_run(run_id, to).await?;
        Ok(())
    }

    async fn next_attempt(&self, run_id: &RunId, stage: Stage) -> Result<u32> {
        let results = self.runs.stage_results(run_id).await?;
        Ok(results.iter().filter(|r| r.stage == stage.name()).count() as u32 + 1)
    }

    async fn record_event(
        &self,
        run_id: &RunId,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let seq = self.runs.events(run_id).await?.len() as u64 + 1;
        self.runs
            .append_event(
                run_id,
                RunEvent {
                    seq,
                    kind: kind.to_string(),
                    payload,
                    timestamp: Utc::now(),
                },
            )
            .await?;
        Ok(())
    }
}

fn map_lock_error(err: StorageError) -> PipelineError {
    match err {
        StorageError::LockHeld { stack_id, holder } => {
            PipelineError::AlreadyLocked { stack_id, holder }
        }
        other => PipelineError::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApprovalSettings, StageSettings};
    use crate::executor::RetryPolicy;
    use stackgate_state::fakes::{MemoryArtifactStore, MemoryLockManager, MemoryRunStore};

    fn config(approval: bool) -> PipelineConfig {
        let mut stages = HashMap::new();
        for stage in Stage::sequence() {
            if stage.runs_tool() {
                stages.insert(
                    stage,
                    StageSettings::exit_status_tool(vec!["true".into()], 60),
                );
            }
        }
        PipelineConfig {
            stages,
            approval: ApprovalSettings {
                required: approval,
                timeout_secs: None,
            },
            lease_secs: 60,
            lock_wait: LockWaitMode::FailFast,
            retry: RetryPolicy::default(),
        }
    }

    fn engine(approval: bool) -> PipelineEngine {
        let mut adapters: HashMap<Stage, Arc<dyn ToolAdapter>> = HashMap::new();
        for stage in Stage::sequence() {
            if stage.runs_tool() {
                adapters.insert(
                    stage,
                    Arc::new(CommandAdapter::new(vec!["true".into()], 60)),
                );
            }
        }
        PipelineEngine::new(
            Arc::new(MemoryRunStore::new()),
            Arc::new(MemoryLockManager::new()),
            Arc::new(MemoryArtifactStore::new()),
            adapters,
            config(approval),
        )
        .unwrap()
    }

    #[test]
    fn test_pipeline_stages_without_approval() {
        let engine = engine(false);
        let stages = engine.pipeline_stages();
        assert!(!stages.contains(&Stage::Approval));
        assert_eq!(stages.last(), Some(&Stage::Apply));
    }

    #[test]
    fn test_pipeline_stages_with_approval() {
        let engine = engine(true);
        let stages = engine.pipeline_stages();
        assert_eq!(
            stages,
            vec![
                Stage::Validate,
                Stage::Lint,
                Stage::SecurityScan,
                Stage::Plan,
                Stage::Approval,
                Stage::Apply
            ]
        );
    }

    #[test]
    fn test_engine_rejects_missing_adapter() {
        let err = PipelineEngine::new(
            Arc::new(MemoryRunStore::new()),
            Arc::new(MemoryLockManager::new()),
            Arc::new(MemoryArtifactStore::new()),
            HashMap::new(),
            config(false),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_probe_verdict_strings() {
        assert_eq!(ProbeVerdict::Applied.as_str(), "applied");
        assert_eq!(ProbeVerdict::NotApplied.as_str(), "not_applied");
        assert_eq!(ProbeVerdict::Unknown.as_str(), "unknown");
    }
}
