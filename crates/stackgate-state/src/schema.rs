//! Schema definitions for Stackgate SurrealDB tables
//!
//! Tables:
//! - pipeline_runs: one row per pipeline run
//! - stage_results: append-only stage attempt records
//! - run_events: append-only observability event stream
//! - locks: one row per stack's lease slot (fencing token survives release)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Row in the `pipeline_runs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunRow {
    pub run_id: String,
    pub stack_id: String,
    pub revision: String,
    pub triggered_by: String,
    pub tags: serde_json::Value,
    /// `RunState::as_str()` form
    pub state: String,
    pub lock_token: Option<u64>,
    pub cancel_requested: bool,
    #[serde(default, with = "surreal_datetime_opt")]
    pub suspended_at: Option<DateTime<Utc>>,
    pub stages_passed: Option<u32>,
    pub stages_failed: Option<u32>,
    pub duration_ms: Option<u64>,
    pub success: Option<bool>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRunRow {
    /// New row in `created` state.
    pub fn new(
        run_id: String,
        stack_id: String,
        revision: String,
        triggered_by: String,
        tags: serde_json::Value,
    ) -> Self {
        Self {
            run_id,
            stack_id,
            revision,
            triggered_by,
            tags,
            state: "created".to_string(),
            lock_token: None,
            cancel_requested: false,
            suspended_at: None,
            stages_passed: None,
            stages_failed: None,
            duration_ms: None,
            success: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Row in the `stage_results` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResultRow {
    pub run_id: String,
    pub stage: String,
    pub attempt: u32,
    /// `StageStatus::as_str()` form
    pub status: String,
    pub exit_code: Option<i32>,
    pub output_digest: Option<String>,
    pub findings: serde_json::Value,
    pub error_kind: Option<String>,
    /// Append order within the run, for stable retrieval
    pub seq: u64,
    #[serde(with = "surreal_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Row in the `run_events` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventRow {
    pub run_id: String,
    pub seq: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
}

impl RunEventRow {
    pub fn new(run_id: String, seq: u64, kind: String, payload: serde_json::Value) -> Self {
        Self {
            run_id,
            seq,
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Row in the `locks` table — one lease slot per stack.
///
/// `holder` is cleared on release but the row (and `token`) survives so the
/// fencing sequence for the stack never resets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRow {
    pub stack_id: String,
    pub holder: Option<String>,
    pub token: u64,
    #[serde(with = "surreal_datetime")]
    pub acquired_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub expires_at: DateTime<Utc>,
}
