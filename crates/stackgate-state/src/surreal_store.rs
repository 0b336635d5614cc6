//! SurrealDB-backed RunStore and LockManager implementations
//!
//! Uses `schema::PipelineRunRow`, `schema::StageResultRow`,
//! `schema::RunEventRow`, and `schema::LockRow` for persistence, converting
//! to/from `storage_traits` types at the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::schema::{LockRow, PipelineRunRow, RunEventRow, StageResultRow};
use crate::storage_traits::{
    ContentDigest, LockManager, LockRecord, RunEvent, RunId, RunMetadata, RunRecord, RunState,
    RunStore, RunSummary, StackId, StageResultRecord, StageStatus, StorageResult,
};

/// SurrealDB-backed implementation of [`RunStore`].
pub struct SurrealRunStore {
    db: Surreal<Any>,
}

impl SurrealRunStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `stackgate/main`, and runs `init_schema`.
    pub async fn in_memory() -> StorageResult<Self> {
        let db = connect("mem://").await?;
        info!("SurrealRunStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Create from the `SURREALDB_URL` environment variable, falling back to
    /// local persistence in `.stackgate/db`.
    pub async fn from_env() -> StorageResult<Self> {
        let url = match std::env::var("SURREALDB_URL") {
            Ok(url) => url,
            Err(_) => {
                let path = ".stackgate/db";
                std::fs::create_dir_all(path).map_err(|e| {
                    StorageError::Backend(format!(
                        "failed to create database directory {}: {}",
                        path, e
                    ))
                })?;
                info!("SURREALDB_URL not set, using local persistence at {path}");
                format!("surrealkv://{path}")
            }
        };
        let db = connect(&url).await?;
        info!("SurrealRunStore connected ({url})");
        Ok(Self { db })
    }

    /// Share the connection with a [`SurrealLockManager`].
    pub fn lock_manager(&self) -> SurrealLockManager {
        SurrealLockManager {
            db: self.db.clone(),
        }
    }

    // -- private helpers -----------------------------------------------------

    /// Fetch a run row by ID, or RunNotFound.
    async fn fetch_run(&self, rid: &str) -> StorageResult<PipelineRunRow> {
        let rid_owned = rid.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM pipeline_runs WHERE run_id = $rid")
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<PipelineRunRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: rid.to_string(),
            })
    }

    /// Fetch a run row and verify it has not reached a terminal state.
    async fn fetch_active(&self, rid: &str) -> StorageResult<PipelineRunRow> {
        let row = self.fetch_run(rid).await?;
        let state = parse_state(rid, &row.state)?;
        if state.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: rid.to_string(),
                state: row.state,
                expected: "non-terminal".to_string(),
            });
        }
        Ok(row)
    }

    /// Write back an updated run row.
    async fn update_run(&self, row: PipelineRunRow) -> StorageResult<()> {
        let rid_owned = row.run_id.clone();
        self.db
            .query("UPDATE pipeline_runs CONTENT $row WHERE run_id = $rid")
            .bind(("row", row))
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Next append-order seq for a run's stage results.
    async fn next_stage_seq(&self, rid: &str) -> StorageResult<u64> {
        let rid_owned = rid.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM stage_results WHERE run_id = $rid")
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<StageResultRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.len() as u64 + 1)
    }

    /// Convert a DB row into a `storage_traits::RunRecord`.
    fn row_to_record(row: PipelineRunRow) -> StorageResult<RunRecord> {
        let state = parse_state(&row.run_id, &row.state)?;

        let summary = match (row.stages_passed, row.stages_failed, row.duration_ms) {
            (Some(stages_passed), Some(stages_failed), Some(duration_ms)) => Some(RunSummary {
                stages_passed,
                stages_failed,
                duration_ms,
                success: row.success.unwrap_or(false),
            }),
            _ => None,
        };

        Ok(RunRecord {
            run_id: RunId(row.run_id),
            stack_id: StackId(row.stack_id),
            revision: row.revision,
            metadata: RunMetadata {
                triggered_by: row.triggered_by,
                tags: row.tags,
            },
            state,
            lock_token: row.lock_token,
            cancel_requested: row.cancel_requested,
            suspended_at: row.suspended_at,
            summary,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }

    fn row_to_stage_result(row: StageResultRow) -> StorageResult<StageResultRecord> {
        let status =
            StageStatus::parse(&row.status).ok_or_else(|| StorageError::Backend(format!(
                "unknown stage status: {}",
                row.status
            )))?;
        let output_digest = row.output_digest.map(ContentDigest::try_from).transpose()?;
        Ok(StageResultRecord {
            stage: row.stage,
            attempt: row.attempt,
            status,
            exit_code: row.exit_code,
            output_digest,
            findings: row.findings,
            error_kind: row.error_kind,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

async fn connect(url: &str) -> StorageResult<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

    db.use_ns("stackgate")
        .use_db("main")
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

    migrations::init_schema(&db).await?;
    Ok(db)
}

fn parse_state(rid: &str, s: &str) -> StorageResult<RunState> {
    RunState::parse(s).ok_or_else(|| {
        StorageError::Backend(format!("unknown run state '{s}' for run {rid}"))
    })
}

#[async_trait]
impl RunStore for SurrealRunStore {
    async fn create_run(
        &self,
        stack_id: &StackId,
        revision: &str,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let row = PipelineRunRow::new(
            run_id.0.clone(),
            stack_id.0.clone(),
            revision.to_string(),
            metadata.triggered_by,
            metadata.tags,
        );

        debug!(run_id = %run_id, stack_id = %stack_id, "creating pipeline run");

        let _created: Option<PipelineRunRow> = self
            .db
            .create("pipeline_runs")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(run_id)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let row = self.fetch_run(&run_id.0).await?;
        Self::row_to_record(row)
    }

    async fn list_runs(&self, stack_id: Option<&StackId>) -> StorageResult<Vec<RunRecord>> {
        let rows: Vec<PipelineRunRow> = if let Some(stack) = stack_id {
            let sid = stack.0.clone();
            let mut res = self
                .db
                .query("SELECT * FROM pipeline_runs WHERE stack_id = $sid ORDER BY created_at DESC")
                .bind(("sid", sid))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM pipeline_runs ORDER BY created_at DESC")
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn list_runs_in_state(&self, state: RunState) -> StorageResult<Vec<RunRecord>> {
        let wanted = state.as_str().to_string();
        let mut res = self
            .db
            .query("SELECT * FROM pipeline_runs WHERE state = $state")
            .bind(("state", wanted))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<PipelineRunRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn transition_run(&self, run_id: &RunId, state: RunState) -> StorageResult<()> {
        if state.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                state: state.to_string(),
                expected: "non-terminal (use finalize_run)".to_string(),
            });
        }
        let mut row = self.fetch_active(&run_id.0).await?;
        row.state = state.as_str().to_string();
        self.update_run(row).await
    }

    async fn finalize_run(
        &self,
        run_id: &RunId,
        state: RunState,
        summary: RunSummary,
    ) -> StorageResult<()> {
        if !state.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                state: state.to_string(),
                expected: "terminal".to_string(),
            });
        }
        let mut row = self.fetch_active(&run_id.0).await?;
        row.state = state.as_str().to_string();
        row.stages_passed = Some(summary.stages_passed);
        row.stages_failed = Some(summary.stages_failed);
        row.duration_ms = Some(summary.duration_ms);
        row.success = Some(summary.success);
        row.completed_at = Some(Utc::now());
        self.update_run(row).await
    }

    async fn set_lock_token(&self, run_id: &RunId, token: Option<u64>) -> StorageResult<()> {
        let mut row = self.fetch_active(&run_id.0).await?;
        row.lock_token = token;
        self.update_run(row).await
    }

    async fn set_suspended_at(
        &self,
        run_id: &RunId,
        at: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        let mut row = self.fetch_active(&run_id.0).await?;
        row.suspended_at = at;
        self.update_run(row).await
    }

    async fn request_cancel(&self, run_id: &RunId) -> StorageResult<()> {
        let mut row = self.fetch_active(&run_id.0).await?;
        row.cancel_requested = true;
        self.update_run(row).await
    }

    async fn append_stage_result(
        &self,
        run_id: &RunId,
        result: StageResultRecord,
    ) -> StorageResult<()> {
        self.fetch_active(&run_id.0).await?;
        let seq = self.next_stage_seq(&run_id.0).await?;

        let row = StageResultRow {
            run_id: run_id.0.clone(),
            stage: result.stage,
            attempt: result.attempt,
            status: result.status.as_str().to_string(),
            exit_code: result.exit_code,
            output_digest: result.output_digest.map(|d| d.as_str().to_string()),
            findings: result.findings,
            error_kind: result.error_kind,
            seq,
            started_at: result.started_at,
            finished_at: result.finished_at,
        };

        let _created: Option<StageResultRow> = self
            .db
            .create("stage_results")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn stage_results(&self, run_id: &RunId) -> StorageResult<Vec<StageResultRecord>> {
        self.fetch_run(&run_id.0).await?;

        let rid_owned = run_id.0.clone();
        let mut res = self
            .db
            .query("SELECT * FROM stage_results WHERE run_id = $rid ORDER BY seq ASC")
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<StageResultRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().map(Self::row_to_stage_result).collect()
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        self.fetch_active(&run_id.0).await?;

        let row = RunEventRow::new(run_id.0.clone(), event.seq, event.kind, event.payload);

        let _created: Option<RunEventRow> = self
            .db
            .create("run_events")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        self.fetch_run(&run_id.0).await?;

        let rid_owned = run_id.0.clone();
        let mut res = self
            .db
            .query("SELECT * FROM run_events WHERE run_id = $rid ORDER BY seq ASC")
            .bind(("rid", rid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<RunEventRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| RunEvent {
                seq: row.seq,
                kind: row.kind,
                payload: row.payload,
                timestamp: row.timestamp,
            })
            .collect())
    }
}

/// SurrealDB-backed implementation of [`LockManager`].
///
/// The lease row is updated with a `WHERE token = $expected` guard so a
/// concurrent reclaim of the same expired lease cannot both succeed.
pub struct SurrealLockManager {
    db: Surreal<Any>,
}

impl SurrealLockManager {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> StorageResult<Self> {
        let db = connect("mem://").await?;
        info!("SurrealLockManager connected (in-memory)");
        Ok(Self { db })
    }

    async fn fetch_slot(&self, stack_id: &str) -> StorageResult<Option<LockRow>> {
        let sid_owned = stack_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM locks WHERE stack_id = $sid")
            .bind(("sid", sid_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let rows: Vec<LockRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    /// Compare-and-swap the slot row: the update only lands if the stored
    /// token still matches `expected`.
    async fn cas_slot(&self, row: LockRow, expected: u64) -> StorageResult<bool> {
        let sid_owned = row.stack_id.clone();
        let mut res = self
            .db
            .query("UPDATE locks CONTENT $row WHERE stack_id = $sid AND token = $expected")
            .bind(("row", row))
            .bind(("sid", sid_owned))
            .bind(("expected", expected))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let updated: Vec<LockRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(!updated.is_empty())
    }
}

#[async_trait]
impl LockManager for SurrealLockManager {
    async fn acquire(
        &self,
        stack_id: &StackId,
        holder: &RunId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<u64> {
        match self.fetch_slot(&stack_id.0).await? {
            None => {
                let row = LockRow {
                    stack_id: stack_id.0.clone(),
                    holder: Some(holder.0.clone()),
                    token: 1,
                    acquired_at: now,
                    expires_at: now + lease,
                };
                let _created: Option<LockRow> = self
                    .db
                    .create("locks")
                    .content(row)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                Ok(1)
            }
            Some(slot) => {
                let live = slot.holder.is_some() && slot.expires_at > now;
                if live {
                    let current = slot.holder.clone().unwrap_or_default();
                    if current == holder.0 {
                        // Idempotent re-acquire extends the lease.
                        let mut renewed = slot.clone();
                        renewed.expires_at = now + lease;
                        if !self.cas_slot(renewed, slot.token).await? {
                            return Err(StorageError::StaleLockToken {
                                stack_id: stack_id.0.clone(),
                                token: slot.token,
                            });
                        }
                        return Ok(slot.token);
                    }
                    return Err(StorageError::LockHeld {
                        stack_id: stack_id.0.clone(),
                        holder: current,
                    });
                }

                // Expired or released: reclaim with a strictly greater token.
                let reclaimed = LockRow {
                    stack_id: stack_id.0.clone(),
                    holder: Some(holder.0.clone()),
                    token: slot.token + 1,
                    acquired_at: now,
                    expires_at: now + lease,
                };
                if !self.cas_slot(reclaimed, slot.token).await? {
                    // Someone else reclaimed between our read and write.
                    return Err(StorageError::LockHeld {
                        stack_id: stack_id.0.clone(),
                        holder: "unknown".to_string(),
                    });
                }
                Ok(slot.token + 1)
            }
        }
    }

    async fn renew(
        &self,
        stack_id: &StackId,
        token: u64,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let slot = self
            .fetch_slot(&stack_id.0)
            .await?
            .ok_or_else(|| StorageError::LockNotFound {
                stack_id: stack_id.0.clone(),
            })?;
        if slot.holder.is_none() || slot.token != token || slot.expires_at <= now {
            return Err(StorageError::StaleLockToken {
                stack_id: stack_id.0.clone(),
                token,
            });
        }
        let mut renewed = slot;
        renewed.expires_at = now + lease;
        if !self.cas_slot(renewed, token).await? {
            return Err(StorageError::StaleLockToken {
                stack_id: stack_id.0.clone(),
                token,
            });
        }
        Ok(())
    }

    async fn release(&self, stack_id: &StackId, token: u64) -> StorageResult<()> {
        let slot = self
            .fetch_slot(&stack_id.0)
            .await?
            .ok_or_else(|| StorageError::LockNotFound {
                stack_id: stack_id.0.clone(),
            })?;
        if slot.holder.is_none() || slot.token != token {
            return Err(StorageError::StaleLockToken {
                stack_id: stack_id.0.clone(),
                token,
            });
        }
        let mut released = slot;
        released.holder = None;
        if !self.cas_slot(released, token).await? {
            return Err(StorageError::StaleLockToken {
                stack_id: stack_id.0.clone(),
                token,
            });
        }
        Ok(())
    }

    async fn inspect(
        &self,
        stack_id: &StackId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<LockRecord>> {
        Ok(self.fetch_slot(&stack_id.0).await?.and_then(|slot| {
            let holder = slot.holder?;
            if slot.expires_at <= now {
                return None;
            }
            Some(LockRecord {
                stack_id: stack_id.clone(),
                holder: RunId(holder),
                token: slot.token,
                acquired_at: slot.acquired_at,
                expires_at: slot.expires_at,
            })
        }))
    }
}
