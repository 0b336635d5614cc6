//! Run state machine and trigger events.
//!
//! The allowed-transition table is explicit: the pipeline is a linear
//! sequence with a single optional fork at Approval, so every legal edge is
//! enumerated here rather than derived by a general scheduler.

use serde::{Deserialize, Serialize};
use stackgate_state::{RunState, StackId};

/// Trigger event carried by the ingress (webhook receiver, operator re-run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Source revision reference (e.g. a commit SHA)
    pub revision: String,
    /// The shared infrastructure state this run may mutate
    pub stack_id: StackId,
    /// Who or what triggered the run
    pub triggered_by: String,
    /// Arbitrary metadata forwarded into the run record
    pub tags: serde_json::Value,
}

impl TriggerEvent {
    pub fn new(
        revision: impl Into<String>,
        stack_id: impl Into<String>,
        triggered_by: impl Into<String>,
    ) -> Self {
        Self {
            revision: revision.into(),
            stack_id: StackId(stack_id.into()),
            triggered_by: triggered_by.into(),
            tags: serde_json::Value::Null,
        }
    }

    pub fn with_tags(mut self, tags: serde_json::Value) -> Self {
        self.tags = tags;
        self
    }
}

/// Whether the run state machine permits the edge `from -> to`.
///
/// Any non-terminal state may abort (operator cancellation) or fail
/// (infrastructure error) except Applying, whose only exits are the apply
/// outcome itself — cancellation during Applying is deferred to the next
/// safe boundary instead of interrupting the mutation.
pub fn can_transition(from: RunState, to: RunState) -> bool {
    use RunState::*;
    if from.is_terminal() {
        return false;
    }
    match (from, to) {
        (Created, Validating) => true,
        (Validating, Linting) => true,
        (Linting, ScanningSecurity) => true,
        (ScanningSecurity, Planning) => true,
        // The single fork: straight to Apply, or park for approval.
        (Planning, AwaitingApproval) => true,
        (Planning, Applying) => true,
        (AwaitingApproval, Applying) => true,
        (Applying, Succeeded) => true,
        (Applying, Failed) => true,
        // Every non-applying active state may fail or abort.
        (_, Failed) => !matches!(from, Applying),
        (_, Aborted) => !matches!(from, Applying),
        _ => false,
    }
}
