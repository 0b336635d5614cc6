//! Approval gate — the suspension point between Plan and Apply.
//!
//! A run parks in `AwaitingApproval` as persisted state, not as a blocked
//! worker; the decision functions here are pure (time passed explicitly)
//! and the engine re-enters the state machine when a decision arrives.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use stackgate_state::{RunId, StackId};

use crate::domain::error::{PipelineError, Result};

/// A pending approval for one run's progression to Apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: RunId,
    pub stack_id: StackId,
    pub requested_at: DateTime<Utc>,
    /// Deadline after which the request expires (run aborts)
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ApprovalStatus,
}

/// Status of an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for an external decision.
    Pending,
    /// Approved — execution may proceed to Apply.
    Approved { actor: String },
    /// Rejected by a reviewer.
    Rejected { actor: String, reason: String },
    /// The request expired without a decision.
    Expired,
}

impl ApprovalStatus {
    /// Whether the request allows the run to proceed to Apply.
    pub fn allows_proceed(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }

    /// Whether the request is decided (no further decisions accepted).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// An external reviewer's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum ApprovalDecision {
    Approve,
    Reject { reason: String },
}

impl ApprovalRequest {
    /// Create a new pending request.
    pub fn new(
        run_id: RunId,
        stack_id: StackId,
        timeout_secs: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        let expires_at = timeout_secs.map(|s| now + Duration::seconds(s as i64));
        Self {
            run_id,
            stack_id,
            requested_at: now,
            expires_at,
            status: ApprovalStatus::Pending,
        }
    }

    /// Check whether this request has expired at the given time.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

/// Apply an external decision to a pending request.
///
/// # Errors
///
/// Returns `ApprovalExpired` if the deadline passed before the decision
/// (and marks the request Expired). Returns `ApprovalRejected` when the
/// decision is a rejection — the caller aborts the run with that detail.
/// A decision on an already-decided request is an invalid-transition error.
pub fn submit_decision(
    request: &mut ApprovalRequest,
    decision: ApprovalDecision,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    if request.status.is_terminal() {
        return Err(PipelineError::Configuration(format!(
            "approval for run {} already decided",
            request.run_id
        )));
    }

    if request.is_expired_at(now) {
        request.status = ApprovalStatus::Expired;
        return Err(PipelineError::ApprovalExpired {
            run_id: request.run_id.to_string(),
        });
    }

    match decision {
        ApprovalDecision::Approve => {
            request.status = ApprovalStatus::Approved {
                actor: actor.to_string(),
            };
            Ok(())
        }
        ApprovalDecision::Reject { reason } => {
            request.status = ApprovalStatus::Rejected {
                actor: actor.to_string(),
                reason: reason.clone(),
            };
            Err(PipelineError::ApprovalRejected {
                actor: actor.to_string(),
                reason,
            })
        }
    }
}
