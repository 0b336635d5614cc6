//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryRunStore`, `MemoryLockManager`, and `MemoryArtifactStore`
//! that satisfy the trait contracts without any external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunEntry {
    record: RunRecord,
    stage_results: Vec<StageResultRecord>,
    events: Vec<RunEvent>,
}

/// In-memory run store backed by a `HashMap<RunId, RunEntry>`.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, RunEntry>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn active_entry<'a>(
    runs: &'a mut HashMap<String, RunEntry>,
    run_id: &RunId,
) -> StorageResult<&'a mut RunEntry> {
    let entry = runs
        .get_mut(&run_id.0)
        .ok_or_else(|| StorageError::RunNotFound {
            run_id: run_id.0.clone(),
        })?;
    if entry.record.state.is_terminal() {
        return Err(StorageError::InvalidRunState {
            run_id: run_id.0.clone(),
            state: entry.record.state.to_string(),
            expected: "non-terminal".to_string(),
        });
    }
    Ok(entry)
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(
        &self,
        stack_id: &StackId,
        revision: &str,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = RunRecord {
            run_id: run_id.clone(),
            stack_id: stack_id.clone(),
            revision: revision.to_string(),
            metadata,
            state: RunState::Created,
            lock_token: None,
            cancel_requested: false,
            suspended_at: None,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut runs = self.runs.lock().unwrap();
        runs.insert(
            run_id.0.clone(),
            RunEntry {
                record,
                stage_results: Vec::new(),
                events: Vec::new(),
            },
        );
        Ok(run_id)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let runs = self.runs.lock().unwrap();
        runs.get(&run_id.0)
            .map(|e| e.record.clone())
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn list_runs(&self, stack_id: Option<&StackId>) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let records: Vec<RunRecord> = runs
            .values()
            .filter(|e| stack_id.map(|s| e.record.stack_id == *s).unwrap_or(true))
            .map(|e| e.record.clone())
            .collect();
        Ok(records)
    }

    async fn list_runs_in_state(&self, state: RunState) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        Ok(runs
            .values()
            .filter(|e| e.record.state == state)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn transition_run(&self, run_id: &RunId, state: RunState) -> StorageResult<()> {
        if state.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                state: state.to_string(),
                expected: "non-terminal (use finalize_run)".to_string(),
            });
        }
        let mut runs = self.runs.lock().unwrap();
        let entry = active_entry(&mut runs, run_id)?;
        entry.record.state = state;
        Ok(())
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
        let mut runs = self.runs.lock().unwrap();
        let entry = active_entry(&mut runs, run_id)?;
        entry.record.state = state;
        entry.record.summary = Some(summary);
        entry.record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn set_lock_token(&self, run_id: &RunId, token: Option<u64>) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let entry = active_entry(&mut runs, run_id)?;
        entry.record.lock_token = token;
        Ok(())
    }

    async fn set_suspended_at(
        &self,
        run_id: &RunId,
        at: Option<DateTime<Utc>>,
    ) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let entry = active_entry(&mut runs, run_id)?;
        entry.record.suspended_at = at;
        Ok(())
    }

    async fn request_cancel(&self, run_id: &RunId) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let entry = active_entry(&mut runs, run_id)?;
        entry.record.cancel_requested = true;
        Ok(())
    }

    async fn append_stage_result(
        &self,
        run_id: &RunId,
        result: StageResultRecord,
    ) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let entry = active_entry(&mut runs, run_id)?;
        entry.stage_results.push(result);
        Ok(())
    }

    async fn stage_results(&self, run_id: &RunId) -> StorageResult<Vec<StageResultRecord>> {
        let runs = self.runs.lock().unwrap();
        let entry = runs
            .get(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        Ok(entry.stage_results.clone())
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let entry = active_entry(&mut runs, run_id)?;
        entry.events.push(event);
        Ok(())
    }

    async fn events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        let runs = self.runs.lock().unwrap();
        let entry = runs
            .get(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        let mut events = entry.events.clone();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// MemoryLockManager
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LockSlot {
    /// Last token ever granted for this stack. Survives release and expiry
    /// so the fencing sequence never resets.
    last_token: u64,
    holder: Option<RunId>,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// In-memory lock registry backed by a `HashMap<StackId, LockSlot>`.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    slots: Mutex<HashMap<String, LockSlot>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(
        &self,
        stack_id: &StackId,
        holder: &RunId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(&stack_id.0) {
            Some(slot) => {
                if slot.expires_at > now {
                    if let Some(current) = slot.holder.clone() {
                        if current == *holder {
                            // Idempotent re-acquire extends the lease.
                            slot.expires_at = now + lease;
                            return Ok(slot.last_token);
                        }
                        return Err(StorageError::LockHeld {
                            stack_id: stack_id.0.clone(),
                            holder: current.0,
                        });
                    }
                }
                // Expired or released: reclaim with a strictly greater token.
                slot.last_token += 1;
                slot.holder = Some(holder.clone());
                slot.acquired_at = now;
                slot.expires_at = now + lease;
                Ok(slot.last_token)
            }
            None => {
                slots.insert(
                    stack_id.0.clone(),
                    LockSlot {
                        last_token: 1,
                        holder: Some(holder.clone()),
                        acquired_at: now,
                        expires_at: now + lease,
                    },
                );
                Ok(1)
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
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .get_mut(&stack_id.0)
            .ok_or_else(|| StorageError::LockNotFound {
                stack_id: stack_id.0.clone(),
            })?;
        if slot.holder.is_none() || slot.last_token != token || slot.expires_at <= now {
            return Err(StorageError::StaleLockToken {
                stack_id: stack_id.0.clone(),
                token,
            });
        }
        slot.expires_at = now + lease;
        Ok(())
    }

    async fn release(&self, stack_id: &StackId, token: u64) -> StorageResult<()> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .get_mut(&stack_id.0)
            .ok_or_else(|| StorageError::LockNotFound {
                stack_id: stack_id.0.clone(),
            })?;
        if slot.holder.is_none() || slot.last_token != token {
            return Err(StorageError::StaleLockToken {
                stack_id: stack_id.0.clone(),
                token,
            });
        }
        slot.holder = None;
        Ok(())
    }

    async fn inspect(
        &self,
        stack_id: &StackId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<LockRecord>> {
        let slots = self.slots.lock().unwrap();
        Ok(slots.get(&stack_id.0).and_then(|slot| {
            let holder = slot.holder.as_ref()?;
            if slot.expires_at <= now {
                return None;
            }
            Some(LockRecord {
                stack_id: stack_id.clone(),
                holder: holder.clone(),
                token: slot.last_token,
                acquired_at: slot.acquired_at,
                expires_at: slot.expires_at,
            })
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

/// In-memory artifact store keyed by (run, stage, digest).
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    blobs: Mutex<HashMap<(String, String, String), Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs stored (used by dedup tests).
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn blob_key(artifact: &ArtifactRef) -> (String, String, String) {
    (
        artifact.run_id.0.clone(),
        artifact.stage.clone(),
        artifact.digest.as_str().to_string(),
    )
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, run_id: &RunId, stage: &str, data: &[u8]) -> StorageResult<ArtifactRef> {
        let digest = ContentDigest::from_bytes(data);
        let artifact = ArtifactRef {
            run_id: run_id.clone(),
            stage: stage.to_string(),
            digest,
        };
        let mut blobs = self.blobs.lock().unwrap();
        blobs.entry(blob_key(&artifact)).or_insert_with(|| data.to_vec());
        Ok(artifact)
    }

    async fn get(&self, artifact: &ArtifactRef) -> StorageResult<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap();
        blobs
            .get(&blob_key(artifact))
            .cloned()
            .ok_or_else(|| StorageError::ArtifactNotFound {
                run_id: artifact.run_id.0.clone(),
                stage: artifact.stage.clone(),
                digest: artifact.digest.as_str().to_string(),
            })
    }

    async fn contains(&self, artifact: &ArtifactRef) -> StorageResult<bool> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs.contains_key(&blob_key(artifact)))
    }
}
