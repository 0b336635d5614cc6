//! SurrealDB schema migrations and initialization
//!
//! Initialization functions that set up all tables with constraints and
//! indexes. Idempotent; called once per connection.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Initialize all Stackgate tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing Stackgate SurrealDB schema");

    init_pipeline_runs_table(db).await?;
    init_stage_results_table(db).await?;
    init_run_events_table(db).await?;
    init_locks_table(db).await?;

    info!("Stackgate schema initialization complete");
    Ok(())
}

/// Initialize `pipeline_runs` table
///
/// Constraints:
/// - `run_id` is unique
/// - `state` transitions and terminal-run immutability are enforced in
///   application logic (`SurrealRunStore`)
/// - Rows are never deleted: completed runs are the audit record
async fn init_pipeline_runs_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing pipeline_runs table");

    let sql = r#"
        DEFINE TABLE pipeline_runs
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        -- Ensure run_id is unique
        DEFINE INDEX idx_run_id ON TABLE pipeline_runs COLUMNS run_id UNIQUE;

        -- Index stack_id for per-stack run listings
        DEFINE INDEX idx_stack_id ON TABLE pipeline_runs COLUMNS stack_id;

        -- Index state for reconcile/reaper scans (runs left in applying, awaiting_approval)
        DEFINE INDEX idx_state ON TABLE pipeline_runs COLUMNS state;

        -- Index created_at for time-range queries
        DEFINE INDEX idx_created_at ON TABLE pipeline_runs COLUMNS created_at;

        -- Composite index (stack_id, created_at) for stack history
        DEFINE INDEX idx_stack_id_created_at ON TABLE pipeline_runs COLUMNS stack_id, created_at;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    info!("✓ pipeline_runs table initialized");
    Ok(())
}

/// Initialize `stage_results` table
///
/// Constraints:
/// - Append-only: retries append new attempt rows, history is never updated
/// - `(run_id, seq)` unique preserves append order per run
async fn init_stage_results_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing stage_results table");

    let sql = r#"
        DEFINE TABLE stage_results
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        -- Composite unique index: append order within a run
        DEFINE INDEX idx_run_id_seq ON TABLE stage_results COLUMNS run_id, seq UNIQUE;

        -- Index run_id for fast retrieval by run
        DEFINE INDEX idx_run_id ON TABLE stage_results COLUMNS run_id;

        -- Index (run_id, stage) for per-stage attempt history
        DEFINE INDEX idx_run_id_stage ON TABLE stage_results COLUMNS run_id, stage;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    info!("✓ stage_results table initialized");
    Ok(())
}

/// Initialize `run_events` table
///
/// Constraints:
/// - `(run_id, seq)` is unique (prevents duplicate sequence numbers)
/// - `seq` is monotonically increasing within a run, enforced by the engine
async fn init_run_events_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing run_events table");

    let sql = r#"
        DEFINE TABLE run_events
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update NONE
                FOR delete NONE;

        -- Composite unique index: (run_id, seq) ensures no duplicate sequences per run
        DEFINE INDEX idx_run_id_seq ON TABLE run_events COLUMNS run_id, seq UNIQUE;

        -- Index run_id for fast event retrieval by run
        DEFINE INDEX idx_run_id ON TABLE run_events COLUMNS run_id;

        -- Index event kind for filtering by event type
        DEFINE INDEX idx_kind ON TABLE run_events COLUMNS kind;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    info!("✓ run_events table initialized");
    Ok(())
}

/// Initialize `locks` table
///
/// Constraints:
/// - One row per stack (`stack_id` unique) — the lease slot
/// - The fencing `token` only ever increases; rows are never deleted so the
///   sequence survives release and expiry
async fn init_locks_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing locks table");

    let sql = r#"
        DEFINE TABLE locks
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        -- One lease slot per stack
        DEFINE INDEX idx_stack_id ON TABLE locks COLUMNS stack_id UNIQUE;

        -- Index expires_at for lease-expiry scans
        DEFINE INDEX idx_expires_at ON TABLE locks COLUMNS expires_at;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    info!("✓ locks table initialized");
    Ok(())
}
