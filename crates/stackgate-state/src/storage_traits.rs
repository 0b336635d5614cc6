//! Storage trait definitions for Stackgate
//!
//! These traits define the core persistence abstractions:
//! - `RunStore`: pipeline run records, stage results, and the per-run event stream
//! - `LockManager`: lease-based mutual exclusion over a stack's shared state
//! - `ArtifactStore`: content-addressed stage output hand-off
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers and digests
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of the shared infrastructure state a run may mutate.
///
/// The unit of lock exclusivity: at most one run holds the lease for a
/// given `StackId` at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackId(pub String);

impl std::fmt::Display for StackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RunStore — pipeline run persistence
// ---------------------------------------------------------------------------

/// Lifecycle state of a pipeline run.
///
/// Terminal states (`Succeeded`, `Failed`, `Aborted`) freeze the record:
/// no further transitions, stage results, or events are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Validating,
    Linting,
    ScanningSecurity,
    Planning,
    AwaitingApproval,
    Applying,
    Succeeded,
    Failed,
    Aborted,
}

impl RunState {
    /// Whether the run has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Stable string form used at the storage boundary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Validating => "validating",
            Self::Linting => "linting",
            Self::ScanningSecurity => "scanning_security",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Applying => "applying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Parse the storage-boundary string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "validating" => Some(Self::Validating),
            "linting" => Some(Self::Linting),
            "scanning_security" => Some(Self::ScanningSecurity),
            "planning" => Some(Self::Planning),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "applying" => Some(Self::Applying),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to a run at trigger time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Who or what triggered the run (webhook, operator, re-run)
    pub triggered_by: String,
    /// Arbitrary key-value tags from the trigger event
    pub tags: serde_json::Value,
}

/// Summary recorded when a run reaches a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Stages that finished Passed
    pub stages_passed: u32,
    /// Stages that finished Failed
    pub stages_failed: u32,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Whether the run succeeded
    pub success: bool,
}

/// Full pipeline run record — the immutable audit row once terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub stack_id: StackId,
    /// Source revision reference the run was triggered for
    pub revision: String,
    pub metadata: RunMetadata,
    pub state: RunState,
    /// Fencing token currently held for the Apply stage, if any
    pub lock_token: Option<u64>,
    /// Cancellation was requested and is pending the next safe boundary
    pub cancel_requested: bool,
    /// When the run parked in AwaitingApproval (drives approval timeout)
    pub suspended_at: Option<DateTime<Utc>>,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Status of one stage attempt within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
    Suspended,
}

impl StageStatus {
    /// Stable string form used at the storage boundary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Suspended => "suspended",
        }
    }

    /// Parse the storage-boundary string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }
}

/// Outcome of one stage attempt.
///
/// Attempts are append-only: a retry appends a new record with an
/// incremented `attempt` rather than mutating history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResultRecord {
    /// Stage name (string at the storage boundary; typed in stackgate-core)
    pub stage: String,
    /// 1-based attempt counter
    pub attempt: u32,
    pub status: StageStatus,
    /// Tool exit code, when a subprocess ran
    pub exit_code: Option<i32>,
    /// Reference to the raw tool output in the artifact store
    pub output_digest: Option<ContentDigest>,
    /// Serialized `Vec<Finding>` from the gate evaluator
    pub findings: serde_json::Value,
    /// Execution-error classification when the failure was infrastructural
    /// (timeout, spawn failure) rather than a gate verdict
    pub error_kind: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A single event in a run's observability stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Monotonic sequence number within the run
    pub seq: u64,
    /// Event kind (e.g. "run.triggered", "stage.passed", "lock.acquired")
    pub kind: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Pipeline run store.
///
/// Guarantees:
/// - Stage results and events are append-only; events are ordered by `seq`.
/// - A terminal run (`Succeeded` | `Failed` | `Aborted`) is immutable —
///   further transitions, stage results, or events are rejected.
/// - Run records are retained indefinitely; no delete operation exists.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a new run in `Created` state, returning its unique ID.
    async fn create_run(
        &self,
        stack_id: &StackId,
        revision: &str,
        metadata: RunMetadata,
    ) -> StorageResult<RunId>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// List runs, optionally filtered by stack.
    async fn list_runs(&self, stack_id: Option<&StackId>) -> StorageResult<Vec<RunRecord>>;

    /// List runs currently in the given state (used by approval reaping
    /// and crash reconciliation).
    async fn list_runs_in_state(&self, state: RunState) -> StorageResult<Vec<RunRecord>>;

    /// Move an active run to a non-terminal state.
    /// Fails with `InvalidRunState` if the run is terminal or `state` is.
    async fn transition_run(&self, run_id: &RunId, state: RunState) -> StorageResult<()>;

    /// Move an active run to a terminal state, recording the summary and
    /// completion timestamp. Fails with `InvalidRunState` if the run is
    /// already terminal or `state` is not terminal.
    async fn finalize_run(
        &self,
        run_id: &RunId,
        state: RunState,
        summary: RunSummary,
    ) -> StorageResult<()>;

    /// Record or clear the fencing token held by the run.
    async fn set_lock_token(&self, run_id: &RunId, token: Option<u64>) -> StorageResult<()>;

    /// Record or clear the approval-suspension timestamp.
    async fn set_suspended_at(
        &self,
        run_id: &RunId,
        at: Option<DateTime<Utc>>,
    ) -> StorageResult<()>;

    /// Flag the run for cancellation at the next safe boundary.
    async fn request_cancel(&self, run_id: &RunId) -> StorageResult<()>;

    /// Append a stage attempt record to an active run.
    async fn append_stage_result(
        &self,
        run_id: &RunId,
        result: StageResultRecord,
    ) -> StorageResult<()>;

    /// Retrieve all stage attempt records, in append order.
    async fn stage_results(&self, run_id: &RunId) -> StorageResult<Vec<StageResultRecord>>;

    /// Append an event to an active run.
    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()>;

    /// Retrieve all events for a run, ordered by seq.
    async fn events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>>;
}

// ---------------------------------------------------------------------------
// LockManager — lease-based mutual exclusion with fencing tokens
// ---------------------------------------------------------------------------

/// A lease over a stack's shared state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub stack_id: StackId,
    /// The run currently holding the lease
    pub holder: RunId,
    /// Fencing token: strictly increases each time the lease changes hands
    pub token: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Lease-based distributed lock registry.
///
/// Guarantees:
/// - At most one unexpired lease per stack.
/// - The fencing token strictly increases every time a lease is granted to
///   a new holder, including reclamation of an expired lease. A holder that
///   lost its lease can therefore be rejected by comparing tokens.
/// - Leases expire passively; expiry is the sole recovery mechanism after a
///   holder crashes without releasing.
///
/// `now` is passed explicitly so expiry logic is deterministic under test.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire the lease for `stack_id`, returning the fencing token.
    ///
    /// Fails with `LockHeld` if an unexpired lease is held by a different
    /// run. Re-acquiring by the current holder is idempotent: the existing
    /// token is returned and the lease extended.
    async fn acquire(
        &self,
        stack_id: &StackId,
        holder: &RunId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<u64>;

    /// Extend the lease. Fails with `StaleLockToken` if `token` no longer
    /// matches the registry or the lease already expired — renewal failure
    /// is lock loss, not a warning.
    async fn renew(
        &self,
        stack_id: &StackId,
        token: u64,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Release the lease. Fails with `StaleLockToken` on token mismatch.
    async fn release(&self, stack_id: &StackId, token: u64) -> StorageResult<()>;

    /// Inspect the current lease. An expired lease reports as `None` but
    /// its token still seeds the next acquisition's increment.
    async fn inspect(
        &self,
        stack_id: &StackId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<LockRecord>>;
}

// ---------------------------------------------------------------------------
// ArtifactStore — content-addressed stage output hand-off
// ---------------------------------------------------------------------------

/// Identifies one immutable artifact: (run, producing stage, content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub run_id: RunId,
    pub stage: String,
    pub digest: ContentDigest,
}

/// Write-once artifact store.
///
/// Guarantees:
/// - `put` hashes content on write and is idempotent for identical content
///   under the same (run, stage): the same ref comes back, nothing is
///   duplicated.
/// - No mutation or deletion API — artifacts are immutable once written;
///   garbage collection is an external storage policy.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a stage's output bytes, returning the artifact reference.
    async fn put(&self, run_id: &RunId, stage: &str, data: &[u8]) -> StorageResult<ArtifactRef>;

    /// Retrieve artifact bytes. Returns `ArtifactNotFound` if absent.
    async fn get(&self, artifact: &ArtifactRef) -> StorageResult<Vec<u8>>;

    /// Check whether the artifact exists without reading it.
    async fn contains(&self, artifact: &ArtifactRef) -> StorageResult<bool>;
}
