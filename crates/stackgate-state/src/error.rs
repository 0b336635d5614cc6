//! Error types for stackgate-state.

use thiserror::Error;

/// Errors that can occur in the pipeline persistence layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend (database or filesystem) failure.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Run record does not exist.
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Operation not valid for the run's current state
    /// (e.g. mutating a run that already reached a terminal state).
    #[error("run {run_id} is in state {state}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        state: String,
        expected: String,
    },

    /// Artifact blob does not exist in the store.
    #[error("artifact not found: run {run_id} stage {stage} digest {digest}")]
    ArtifactNotFound {
        run_id: String,
        stage: String,
        digest: String,
    },

    /// Digest string is not valid lowercase SHA-256 hex.
    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    /// An unexpired lease on the stack is held by another run.
    #[error("stack {stack_id} is locked by run {holder}")]
    LockHeld { stack_id: String, holder: String },

    /// The presented fencing token no longer matches the registry.
    #[error("stale lock token {token} for stack {stack_id}")]
    StaleLockToken { stack_id: String, token: u64 },

    /// No lease record exists for the stack.
    #[error("no lock record for stack {stack_id}")]
    LockNotFound { stack_id: String },

    /// Record could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Filesystem error from the artifact object store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
