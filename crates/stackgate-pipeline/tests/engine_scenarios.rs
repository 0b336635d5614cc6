//! End-to-end engine scenarios over the in-memory fakes.
//!
//! These cover the pipeline's hard guarantees: gate violations halt before
//! Apply, the lock serializes mutation with fencing, approval parks without
//! holding the lock, transient errors retry, and crash reconciliation never
//! invents a success.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use stackgate_core::approval::ApprovalDecision;
use stackgate_core::domain::{ExecutionError, Stage, TriggerEvent};
use stackgate_core::gate::PolicyRuleset;
use stackgate_core::parser::ParserKind;
use stackgate_pipeline::{
    AdapterContext, ApprovalSettings, ExecutionOutcome, InputArtifact, LockWaitMode, NoopProbe,
    PipelineConfig, PipelineEngine, ProbeVerdict, ReconcileProbe, RetryPolicy, StageSettings,
    ToolAdapter,
};
use stackgate_state::fakes::{MemoryArtifactStore, MemoryLockManager, MemoryRunStore};
use stackgate_state::{
    LockManager, LockRecord, RunId, RunState, RunStore, StackId, StageStatus, StorageResult,
};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Scripted stage tool: fails the first `fail_times` calls with a transient
/// error, then returns the configured outcome. Records every input artifact
/// it was handed.
struct FakeAdapter {
    exit_code: i32,
    stdout: String,
    fail_times: u32,
    calls: AtomicU32,
    inputs_seen: Mutex<Vec<InputArtifact>>,
}

impl FakeAdapter {
    fn ok(stdout: &str) -> Arc<Self> {
        Arc::new(Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            fail_times: 0,
            calls: AtomicU32::new(0),
            inputs_seen: Mutex::new(Vec::new()),
        })
    }

    fn with_exit(exit_code: i32, stdout: &str) -> Arc<Self> {
        Arc::new(Self {
            exit_code,
            stdout: stdout.to_string(),
            fail_times: 0,
            calls: AtomicU32::new(0),
            inputs_seen: Mutex::new(Vec::new()),
        })
    }

    fn flaky(fail_times: u32) -> Arc<Self> {
        Arc::new(Self {
            exit_code: 0,
            stdout: String::new(),
            fail_times,
            calls: AtomicU32::new(0),
            inputs_seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolAdapter for FakeAdapter {
    async fn run(&self, ctx: &AdapterContext) -> Result<ExecutionOutcome, ExecutionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs_seen
            .lock()
            .unwrap()
            .extend(ctx.inputs.iter().cloned());
        if call < self.fail_times {
            return Err(ExecutionError::Io {
                message: "transient fault".into(),
            });
        }
        Ok(ExecutionOutcome {
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: String::new(),
            duration_ms: 1,
        })
    }
}

/// Lock manager whose registry token is always one ahead of what it handed
/// out — every fencing re-check sees a stolen lease.
struct StolenLeaseLocks {
    inner: MemoryLockManager,
}

#[async_trait]
impl LockManager for StolenLeaseLocks {
    async fn acquire(
        &self,
        stack_id: &StackId,
        holder: &RunId,
        lease: Duration,
        now: chrono::DateTime<Utc>,
    ) -> StorageResult<u64> {
        self.inner.acquire(stack_id, holder, lease, now).await
    }

    async fn renew(
        &self,
        stack_id: &StackId,
        token: u64,
        lease: Duration,
        now: chrono::DateTime<Utc>,
    ) -> StorageResult<()> {
        self.inner.renew(stack_id, token, lease, now).await
    }

    async fn release(&self, stack_id: &StackId, token: u64) -> StorageResult<()> {
        self.inner.release(stack_id, token).await
    }

    async fn inspect(
        &self,
        stack_id: &StackId,
        now: chrono::DateTime<Utc>,
    ) -> StorageResult<Option<LockRecord>> {
        Ok(self.inner.inspect(stack_id, now).await?.map(|mut record| {
            record.token += 1;
            record.holder = RunId("thief".to_string());
            record
        }))
    }
}

struct FixedProbe(ProbeVerdict);

#[async_trait]
impl ReconcileProbe for FixedProbe {
    async fn verify(&self, _run: &stackgate_state::RunRecord) -> ProbeVerdict {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    runs: Arc<MemoryRunStore>,
    locks: Arc<MemoryLockManager>,
    artifacts: Arc<MemoryArtifactStore>,
    adapters: HashMap<Stage, Arc<FakeAdapter>>,
    engine: PipelineEngine,
}

fn base_config(approval: bool) -> PipelineConfig {
    let mut stages = HashMap::new();
    stages.insert(
        Stage::Validate,
        StageSettings::exit_status_tool(vec!["validator".into()], 60),
    );
    stages.insert(
        Stage::Lint,
        StageSettings::exit_status_tool(vec!["linter".into()], 60),
    );
    stages.insert(
        Stage::SecurityScan,
        StageSettings::json_tool(vec!["scanner".into()], 60),
    );
    stages.insert(
        Stage::Plan,
        StageSettings::exit_status_tool(vec!["planner".into()], 60),
    );
    stages.insert(
        Stage::Apply,
        StageSettings::exit_status_tool(vec!["applier".into()], 120),
    );
    PipelineConfig {
        stages,
        approval: ApprovalSettings {
            required: approval,
            timeout_secs: Some(300),
        },
        lease_secs: 60,
        lock_wait: LockWaitMode::FailFast,
        retry: RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
        },
    }
}

fn harness_with(
    config: PipelineConfig,
    adapters: HashMap<Stage, Arc<FakeAdapter>>,
) -> Harness {
    let runs = Arc::new(MemoryRunStore::new());
    let locks = Arc::new(MemoryLockManager::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());

    let dyn_adapters: HashMap<Stage, Arc<dyn ToolAdapter>> = adapters
        .iter()
        .map(|(stage, adapter)| (*stage, adapter.clone() as Arc<dyn ToolAdapter>))
        .collect();

    let engine = PipelineEngine::new(
        runs.clone(),
        locks.clone(),
        artifacts.clone(),
        dyn_adapters,
        config,
    )
    .expect("engine construction");

    Harness {
        runs,
        locks,
        artifacts,
        adapters,
        engine,
    }
}

fn passing_adapters() -> HashMap<Stage, Arc<FakeAdapter>> {
    let mut adapters = HashMap::new();
    adapters.insert(Stage::Validate, FakeAdapter::ok(""));
    adapters.insert(Stage::Lint, FakeAdapter::ok(""));
    adapters.insert(Stage::SecurityScan, FakeAdapter::ok("[]"));
    adapters.insert(Stage::Plan, FakeAdapter::ok("plan-preview-v1"));
    adapters.insert(Stage::Apply, FakeAdapter::ok("applied"));
    adapters
}

fn trigger_event() -> TriggerEvent {
    TriggerEvent::new("deadbeef", "prod/network", "webhook")
        .with_tags(serde_json::json!({"pr": 42}))
}

const UNENCRYPTED_BUCKET_FINDING: &str = r#"[
    {"rule_id": "S3_BUCKET_ENCRYPTION", "severity": "blocking",
     "resource": "aws_s3_bucket.logs", "message": "bucket is not encrypted at rest"}
]"#;

async fn stage_status(harness: &Harness, run_id: &RunId, stage: Stage) -> Option<StageStatus> {
    harness
        .runs
        .stage_results(run_id)
        .await
        .unwrap()
        .iter()
        .rev()
        .find(|r| r.stage == stage.name())
        .map(|r| r.status)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// Happy path: every gate passes, the plan artifact flows into Apply, the
/// lock is taken and released, the run succeeds.
#[tokio::test]
async fn full_pipeline_succeeds_and_hands_plan_to_apply() {
    let harness = harness_with(base_config(false), passing_adapters());

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    let record = harness.engine.execute(&run_id).await.unwrap();

    assert_eq!(record.state, RunState::Succeeded);
    assert!(record.summary.as_ref().unwrap().success);
    assert_eq!(record.summary.as_ref().unwrap().stages_passed, 5);
    assert!(record.lock_token.is_none());

    // Apply consumed the plan stage's artifact.
    let apply = &harness.adapters[&Stage::Apply];
    assert_eq!(apply.calls(), 1);
    let inputs = apply.inputs_seen.lock().unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].name, "plan");
    assert_eq!(inputs[0].bytes, b"plan-preview-v1");

    // Lock was released.
    assert!(harness
        .locks
        .inspect(&StackId("prod/network".into()), Utc::now())
        .await
        .unwrap()
        .is_none());

    // Event stream covers the lifecycle.
    let events = harness.runs.events(&run_id).await.unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds.first(), Some(&"run.triggered"));
    assert!(kinds.contains(&"lock.acquired"));
    assert!(kinds.contains(&"lock.released"));
    assert_eq!(kinds.last(), Some(&"run.finalized"));
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64 + 1);
    }
}

/// An unencrypted bucket yields a Blocking finding in SecurityScan: the run
/// fails, later stages are skipped, Apply is never invoked.
#[tokio::test]
async fn blocking_finding_halts_before_apply() {
    let mut adapters = passing_adapters();
    adapters.insert(
        Stage::SecurityScan,
        FakeAdapter::ok(UNENCRYPTED_BUCKET_FINDING),
    );
    let harness = harness_with(base_config(false), adapters);

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    let record = harness.engine.execute(&run_id).await.unwrap();

    assert_eq!(record.state, RunState::Failed);
    assert_eq!(stage_status(&harness, &run_id, Stage::SecurityScan).await, Some(StageStatus::Failed));
    assert_eq!(stage_status(&harness, &run_id, Stage::Plan).await, Some(StageStatus::Skipped));
    assert_eq!(stage_status(&harness, &run_id, Stage::Apply).await, Some(StageStatus::Skipped));
    assert_eq!(harness.adapters[&Stage::Plan].calls(), 0);
    assert_eq!(harness.adapters[&Stage::Apply].calls(), 0);

    // The failing record carries the finding for diagnosis.
    let results = harness.runs.stage_results(&run_id).await.unwrap();
    let scan = results
        .iter()
        .find(|r| r.stage == "security_scan")
        .unwrap();
    assert!(scan.findings.to_string().contains("S3_BUCKET_ENCRYPTION"));
}

/// The same scan output under a suppression passes the gate; the waived
/// finding stays in the record, downgraded.
#[tokio::test]
async fn suppressed_finding_passes_the_gate() {
    let mut config = base_config(false);
    config
        .stages
        .get_mut(&Stage::SecurityScan)
        .unwrap()
        .ruleset = PolicyRuleset::strict().suppress_rule_on("S3_BUCKET_ENCRYPTION", "aws_s3_bucket.logs");

    let mut adapters = passing_adapters();
    adapters.insert(
        Stage::SecurityScan,
        FakeAdapter::ok(UNENCRYPTED_BUCKET_FINDING),
    );
    let harness = harness_with(config, adapters);

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    let record = harness.engine.execute(&run_id).await.unwrap();

    assert_eq!(record.state, RunState::Succeeded);
    let results = harness.runs.stage_results(&run_id).await.unwrap();
    let scan = results
        .iter()
        .find(|r| r.stage == "security_scan")
        .unwrap();
    assert_eq!(scan.status, StageStatus::Passed);
    assert!(scan.findings.to_string().contains("\"suppressed\":true"));
}

/// An advisory stage records its failure without halting the run.
#[tokio::test]
async fn advisory_stage_failure_does_not_halt() {
    let mut config = base_config(false);
    config.stages.get_mut(&Stage::Lint).unwrap().gating = false;

    let mut adapters = passing_adapters();
    adapters.insert(Stage::Lint, FakeAdapter::with_exit(3, ""));
    let harness = harness_with(config, adapters);

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    let record = harness.engine.execute(&run_id).await.unwrap();

    assert_eq!(record.state, RunState::Succeeded);
    assert_eq!(stage_status(&harness, &run_id, Stage::Lint).await, Some(StageStatus::Failed));
    assert_eq!(harness.adapters[&Stage::Apply].calls(), 1);
}

/// A tool failure with no findings still gets a Blocking finding attributed
/// to it, so every Failed gate is explainable.
#[tokio::test]
async fn nonzero_exit_synthesizes_blocking_finding() {
    let mut adapters = passing_adapters();
    adapters.insert(Stage::Validate, FakeAdapter::with_exit(2, ""));
    let harness = harness_with(base_config(false), adapters);

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    let record = harness.engine.execute(&run_id).await.unwrap();

    assert_eq!(record.state, RunState::Failed);
    let results = harness.runs.stage_results(&run_id).await.unwrap();
    let validate = results.iter().find(|r| r.stage == "validate").unwrap();
    assert!(validate.findings.to_string().contains("TOOL_EXIT"));
}

/// A held lock fails the second run's Apply with AlreadyLocked; after
/// release the stack is applyable again.
#[tokio::test]
async fn concurrent_runs_serialize_at_the_lock() {
    let harness = harness_with(base_config(false), passing_adapters());
    let stack = StackId("prod/network".into());

    // First holder takes the lease out-of-band (a concurrent run mid-apply).
    let first_holder = RunId::new();
    let token = harness
        .locks
        .acquire(&stack, &first_holder, Duration::seconds(300), Utc::now())
        .await
        .unwrap();

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    let record = harness.engine.execute(&run_id).await.unwrap();

    assert_eq!(record.state, RunState::Failed);
    assert_eq!(harness.adapters[&Stage::Apply].calls(), 0);
    let events = harness.runs.events(&run_id).await.unwrap();
    assert!(events.iter().any(|e| e.kind == "lock.conflict"));

    // Release, and a fresh run goes through.
    harness.locks.release(&stack, token).await.unwrap();
    let run2 = harness.engine.trigger(trigger_event()).await.unwrap();
    let record2 = harness.engine.execute(&run2).await.unwrap();
    assert_eq!(record2.state, RunState::Succeeded);
}

/// In queue mode the Apply waits out a held lock instead of failing fast.
#[tokio::test]
async fn queued_lock_wait_acquires_after_release() {
    let mut config = base_config(false);
    config.lock_wait = LockWaitMode::Queue {
        timeout_secs: 5,
        poll_ms: 10,
    };
    let harness = harness_with(config, passing_adapters());
    let stack = StackId("prod/network".into());

    let holder = RunId::new();
    let token = harness
        .locks
        .acquire(&stack, &holder, Duration::seconds(300), Utc::now())
        .await
        .unwrap();

    let locks = harness.locks.clone();
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        locks.release(&stack, token).await.unwrap();
    });

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    let record = harness.engine.execute(&run_id).await.unwrap();
    releaser.await.unwrap();

    assert_eq!(record.state, RunState::Succeeded);
    assert_eq!(harness.adapters[&Stage::Apply].calls(), 1);
}

/// A stale fencing token is rejected before any mutation.
#[tokio::test]
async fn fenced_apply_never_mutates() {
    let runs = Arc::new(MemoryRunStore::new());
    let locks = Arc::new(StolenLeaseLocks {
        inner: MemoryLockManager::new(),
    });
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let adapters = passing_adapters();
    let dyn_adapters: HashMap<Stage, Arc<dyn ToolAdapter>> = adapters
        .iter()
        .map(|(stage, adapter)| (*stage, adapter.clone() as Arc<dyn ToolAdapter>))
        .collect();
    let engine = PipelineEngine::new(
        runs.clone(),
        locks,
        artifacts,
        dyn_adapters,
        base_config(false),
    )
    .unwrap();

    let run_id = engine.trigger(trigger_event()).await.unwrap();
    let record = engine.execute(&run_id).await.unwrap();

    assert_eq!(record.state, RunState::Failed);
    assert!(record.lock_token.is_none());
    // The mutation never ran.
    assert_eq!(adapters[&Stage::Apply].calls(), 0);
    let events = runs.events(&run_id).await.unwrap();
    assert!(events.iter().any(|e| e.kind == "lock.fenced"));
}

/// Approval parks the run as persisted state with no lock held; approving
/// re-enters the state machine and completes the apply.
#[tokio::test]
async fn approval_parks_then_approve_applies() {
    let harness = harness_with(base_config(true), passing_adapters());

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    let parked = harness.engine.execute(&run_id).await.unwrap();

    assert_eq!(parked.state, RunState::AwaitingApproval);
    assert!(parked.suspended_at.is_some());
    assert_eq!(stage_status(&harness, &run_id, Stage::Approval).await, Some(StageStatus::Suspended));
    assert_eq!(harness.adapters[&Stage::Apply].calls(), 0);
    // Parking holds no lock.
    assert!(harness
        .locks
        .inspect(&StackId("prod/network".into()), Utc::now())
        .await
        .unwrap()
        .is_none());

    let record = harness
        .engine
        .submit_approval(&run_id, ApprovalDecision::Approve, "alice")
        .await
        .unwrap();

    assert_eq!(record.state, RunState::Succeeded);
    assert_eq!(stage_status(&harness, &run_id, Stage::Approval).await, Some(StageStatus::Passed));
    assert_eq!(harness.adapters[&Stage::Apply].calls(), 1);
}

/// Rejection aborts the run; Apply is skipped.
#[tokio::test]
async fn approval_rejection_aborts() {
    let harness = harness_with(base_config(true), passing_adapters());

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    harness.engine.execute(&run_id).await.unwrap();

    let record = harness
        .engine
        .submit_approval(
            &run_id,
            ApprovalDecision::Reject {
                reason: "plan touches prod DNS".into(),
            },
            "bob",
        )
        .await
        .unwrap();

    assert_eq!(record.state, RunState::Aborted);
    assert_eq!(stage_status(&harness, &run_id, Stage::Apply).await, Some(StageStatus::Skipped));
    assert_eq!(harness.adapters[&Stage::Apply].calls(), 0);
}

/// Parked runs past their approval deadline are reaped to Aborted.
#[tokio::test]
async fn expired_approvals_are_reaped() {
    let mut config = base_config(true);
    config.approval.timeout_secs = Some(60);
    let harness = harness_with(config, passing_adapters());

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    harness.engine.execute(&run_id).await.unwrap();

    // Not yet expired.
    let reaped = harness
        .engine
        .reap_expired_approvals(Utc::now())
        .await
        .unwrap();
    assert!(reaped.is_empty());

    let reaped = harness
        .engine
        .reap_expired_approvals(Utc::now() + Duration::seconds(120))
        .await
        .unwrap();
    assert_eq!(reaped, vec![run_id.clone()]);

    let record = harness.runs.get_run(&run_id).await.unwrap();
    assert_eq!(record.state, RunState::Aborted);
    assert_eq!(harness.adapters[&Stage::Apply].calls(), 0);
}

/// A late decision on an expired approval aborts the run and reports the
/// expiry to the caller.
#[tokio::test]
async fn late_decision_on_expired_approval() {
    let mut config = base_config(true);
    config.approval.timeout_secs = Some(0);
    let harness = harness_with(config, passing_adapters());

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    harness.engine.execute(&run_id).await.unwrap();

    let err = harness
        .engine
        .submit_approval(&run_id, ApprovalDecision::Approve, "alice")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        stackgate_core::PipelineError::ApprovalExpired { .. }
    ));
    let record = harness.runs.get_run(&run_id).await.unwrap();
    assert_eq!(record.state, RunState::Aborted);
}

/// Transient execution errors retry with new attempt records; the run still
/// succeeds.
#[tokio::test]
async fn transient_error_retries_then_succeeds() {
    let mut adapters = passing_adapters();
    adapters.insert(Stage::Validate, FakeAdapter::flaky(1));
    let harness = harness_with(base_config(false), adapters);

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    let record = harness.engine.execute(&run_id).await.unwrap();

    assert_eq!(record.state, RunState::Succeeded);
    let results = harness.runs.stage_results(&run_id).await.unwrap();
    let validate: Vec<_> = results.iter().filter(|r| r.stage == "validate").collect();
    assert_eq!(validate.len(), 2);
    assert_eq!(validate[0].status, StageStatus::Failed);
    assert_eq!(validate[0].error_kind.as_deref(), Some("io"));
    assert_eq!(validate[0].attempt, 1);
    assert_eq!(validate[1].status, StageStatus::Passed);
    assert_eq!(validate[1].attempt, 2);
}

/// Exhausted retries escalate to a failed run with the error kind recorded.
#[tokio::test]
async fn exhausted_retries_fail_the_run() {
    let mut adapters = passing_adapters();
    adapters.insert(Stage::Plan, FakeAdapter::flaky(10));
    let harness = harness_with(base_config(false), adapters);

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    let record = harness.engine.execute(&run_id).await.unwrap();

    assert_eq!(record.state, RunState::Failed);
    // max_retries = 2 → three attempts, all recorded.
    assert_eq!(harness.adapters[&Stage::Plan].calls(), 3);
    let results = harness.runs.stage_results(&run_id).await.unwrap();
    let plan_attempts: Vec<_> = results.iter().filter(|r| r.stage == "plan").collect();
    assert_eq!(plan_attempts.len(), 3);
    assert!(plan_attempts.iter().all(|r| r.status == StageStatus::Failed));
    assert_eq!(stage_status(&harness, &run_id, Stage::Apply).await, Some(StageStatus::Skipped));
}

/// Cancelling a freshly created run aborts it with the full sequence
/// accounted for as Skipped.
#[tokio::test]
async fn cancel_created_run_aborts_cleanly() {
    let harness = harness_with(base_config(false), passing_adapters());

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    let record = harness.engine.cancel(&run_id).await.unwrap();

    assert_eq!(record.state, RunState::Aborted);
    assert_eq!(stage_status(&harness, &run_id, Stage::Validate).await, Some(StageStatus::Skipped));
    assert_eq!(stage_status(&harness, &run_id, Stage::Apply).await, Some(StageStatus::Skipped));
}

/// Cancelling a parked run aborts it; the approval record shows the
/// suspension.
#[tokio::test]
async fn cancel_parked_run_aborts() {
    let harness = harness_with(base_config(true), passing_adapters());

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    harness.engine.execute(&run_id).await.unwrap();

    let record = harness.engine.cancel(&run_id).await.unwrap();
    assert_eq!(record.state, RunState::Aborted);
    assert_eq!(harness.adapters[&Stage::Apply].calls(), 0);
}

/// Cancelling a terminal run is rejected.
#[tokio::test]
async fn cancel_terminal_run_rejected() {
    let harness = harness_with(base_config(false), passing_adapters());

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    harness.engine.execute(&run_id).await.unwrap();

    let err = harness.engine.cancel(&run_id).await.unwrap_err();
    assert!(matches!(
        err,
        stackgate_core::PipelineError::InvalidTransition { .. }
    ));
}

/// Crash recovery: a run left in Applying with an expired lease resolves
/// through the probe — and an unverifiable apply is never reported as
/// Succeeded.
#[tokio::test]
async fn reconcile_never_invents_success() {
    let harness = harness_with(base_config(false), passing_adapters());

    // Simulate a crashed engine: run stuck in Applying, lease long expired.
    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    harness
        .runs
        .transition_run(&run_id, RunState::Applying)
        .await
        .unwrap();
    let token = harness
        .locks
        .acquire(
            &StackId("prod/network".into()),
            &run_id,
            Duration::seconds(0),
            Utc::now() - Duration::seconds(60),
        )
        .await
        .unwrap();
    harness
        .runs
        .set_lock_token(&run_id, Some(token))
        .await
        .unwrap();

    let reconciled = harness.engine.reconcile(&NoopProbe).await.unwrap();
    assert_eq!(reconciled, vec![run_id.clone()]);

    let record = harness.runs.get_run(&run_id).await.unwrap();
    assert_eq!(record.state, RunState::Failed);
    assert!(record.lock_token.is_none());
    let results = harness.runs.stage_results(&run_id).await.unwrap();
    let apply = results.iter().find(|r| r.stage == "apply").unwrap();
    assert_eq!(apply.error_kind.as_deref(), Some("reconcile_unverified"));
}

/// Reconciliation with a confirming probe reports the success that actually
/// happened.
#[tokio::test]
async fn reconcile_confirmed_apply_succeeds() {
    let harness = harness_with(base_config(false), passing_adapters());

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    harness
        .runs
        .transition_run(&run_id, RunState::Applying)
        .await
        .unwrap();

    let reconciled = harness
        .engine
        .reconcile(&FixedProbe(ProbeVerdict::Applied))
        .await
        .unwrap();
    assert_eq!(reconciled.len(), 1);

    let record = harness.runs.get_run(&run_id).await.unwrap();
    assert_eq!(record.state, RunState::Succeeded);
}

/// A run whose lease is still live is left alone — another replica may be
/// mid-apply.
#[tokio::test]
async fn reconcile_skips_live_lease() {
    let harness = harness_with(base_config(false), passing_adapters());

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    harness
        .runs
        .transition_run(&run_id, RunState::Applying)
        .await
        .unwrap();
    harness
        .locks
        .acquire(
            &StackId("prod/network".into()),
            &run_id,
            Duration::seconds(300),
            Utc::now(),
        )
        .await
        .unwrap();

    let reconciled = harness.engine.reconcile(&NoopProbe).await.unwrap();
    assert!(reconciled.is_empty());
    let record = harness.runs.get_run(&run_id).await.unwrap();
    assert_eq!(record.state, RunState::Applying);
}

/// Artifact writes are idempotent per (run, stage, content).
#[tokio::test]
async fn artifact_store_stays_deduplicated() {
    let harness = harness_with(base_config(false), passing_adapters());

    let run_id = harness.engine.trigger(trigger_event()).await.unwrap();
    harness.engine.execute(&run_id).await.unwrap();

    // One artifact per tool stage: validate, lint, security_scan, plan, apply.
    assert_eq!(harness.artifacts.len(), 5);
}
