//! Per-work-unit progress tracking, persisted for resumability.
//!
//! The hot path (ack-driven counter bumps) is a lock-free atomic add; the
//! cold path (status transitions, persistence) takes a write lock and
//! flushes a JSON snapshot to the unit's own offset key. Counters only ever
//! increase until the unit reaches a terminal status or is reset for a
//! restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::warn;

use shardpipe_core::{
    CoordinationStore, ProgressSnapshot, Result, WorkUnit, WorkUnitStatus,
};

use crate::keys;

/// Live progress state of one work unit. Shared between the unit's writer
/// (counter bumps) and the coordinator (snapshots, status transitions).
pub struct UnitProgress {
    unit: WorkUnit,
    processed: AtomicU64,
    status: RwLock<WorkUnitStatus>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    ended_at: RwLock<Option<DateTime<Utc>>>,
    message: RwLock<Option<String>>,
}

impl UnitProgress {
    fn new(unit: WorkUnit) -> Self {
        Self {
            unit,
            processed: AtomicU64::new(0),
            status: RwLock::new(WorkUnitStatus::Pending),
            started_at: RwLock::new(None),
            ended_at: RwLock::new(None),
            message: RwLock::new(None),
        }
    }

    /// The work unit this progress belongs to.
    pub fn unit(&self) -> &WorkUnit {
        &self.unit
    }

    /// Bump the processed-row counter (hot path, lock-free). Called from
    /// the channel ack callback with the acked batch's record count.
    pub fn add_processed(&self, records: u64) {
        self.processed.fetch_add(records, Ordering::Relaxed);
    }

    /// Current processed-row count.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Current snapshot of this unit.
    pub async fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            work_unit: self.unit.index,
            table: self.unit.table.clone(),
            estimated_rows: self.unit.estimated_rows,
            processed_rows: self.processed(),
            status: *self.status.read().await,
            started_at: *self.started_at.read().await,
            ended_at: *self.ended_at.read().await,
        }
    }

    /// Failure message recorded on the unit, if any.
    pub async fn message(&self) -> Option<String> {
        self.message.read().await.clone()
    }
}

/// Progress tracker for all work units of one job.
pub struct ProgressTracker {
    job_id: String,
    store: Arc<dyn CoordinationStore>,
    units: Vec<Arc<UnitProgress>>,
}

impl ProgressTracker {
    /// Create a tracker with all units Pending.
    pub fn new(
        job_id: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        units: Vec<WorkUnit>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            store,
            units: units.into_iter().map(|u| Arc::new(UnitProgress::new(u))).collect(),
        }
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Shared handle to one unit's progress.
    pub fn unit(&self, index: usize) -> Arc<UnitProgress> {
        self.units[index].clone()
    }

    /// Mark a unit Running and stamp its start time.
    pub async fn mark_running(&self, index: usize) {
        let unit = &self.units[index];
        *unit.status.write().await = WorkUnitStatus::Running;
        *unit.started_at.write().await = Some(Utc::now());
        self.persist(index).await;
    }

    /// Mark a unit Finished and stamp its end time.
    pub async fn mark_finished(&self, index: usize) {
        let unit = &self.units[index];
        *unit.status.write().await = WorkUnitStatus::Finished;
        *unit.ended_at.write().await = Some(Utc::now());
        self.persist(index).await;
    }

    /// Mark a unit Failed with its error message. Sibling units are not
    /// touched.
    pub async fn mark_failed(&self, index: usize, message: impl Into<String>) {
        let unit = &self.units[index];
        *unit.status.write().await = WorkUnitStatus::Failed;
        *unit.ended_at.write().await = Some(Utc::now());
        *unit.message.write().await = Some(message.into());
        self.persist(index).await;
    }

    /// Reset a unit for a restart: the whole range is re-read from the
    /// beginning, so the counter goes back to zero.
    pub async fn reset(&self, index: usize) {
        let unit = &self.units[index];
        unit.processed.store(0, Ordering::SeqCst);
        *unit.status.write().await = WorkUnitStatus::Pending;
        *unit.started_at.write().await = None;
        *unit.ended_at.write().await = None;
        *unit.message.write().await = None;
    }

    /// Restore one unit's state from a persisted snapshot (resume path).
    /// Only terminal snapshots are worth restoring; a restarted unit
    /// re-reads its range from scratch anyway.
    pub async fn restore(&self, snapshot: &ProgressSnapshot) {
        if snapshot.work_unit >= self.units.len() {
            return;
        }
        let unit = &self.units[snapshot.work_unit];
        unit.processed.store(snapshot.processed_rows, Ordering::SeqCst);
        *unit.status.write().await = snapshot.status;
        *unit.started_at.write().await = snapshot.started_at;
        *unit.ended_at.write().await = snapshot.ended_at;
    }

    /// Snapshots of every unit, in index order.
    pub async fn snapshots(&self) -> Vec<ProgressSnapshot> {
        let mut result = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            result.push(unit.snapshot().await);
        }
        result
    }

    /// Persist one unit's snapshot under its own offset key. Best-effort:
    /// a store failure is logged, not propagated, so progress flushing
    /// never takes down the data path.
    pub async fn persist(&self, index: usize) {
        let snapshot = self.units[index].snapshot().await;
        let key = keys::unit_offset(&self.job_id, index);
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(e) = self.store.put(&key, &json).await {
                    warn!(
                        job_id = %self.job_id,
                        work_unit = index,
                        error = %e,
                        "Failed to persist work unit progress"
                    );
                }
            }
            Err(e) => warn!(
                job_id = %self.job_id,
                work_unit = index,
                error = %e,
                "Failed to serialize work unit progress"
            ),
        }
    }

    /// Load the persisted snapshots of a job, in offset order. Best-effort:
    /// missing or unparsable entries are skipped.
    pub async fn load(
        job_id: &str,
        store: &dyn CoordinationStore,
    ) -> Result<Vec<ProgressSnapshot>> {
        let mut result = Vec::new();
        for key in store.list_children(&keys::unit_offset_prefix(job_id)).await? {
            if let Some(json) = store.get(&key).await? {
                match serde_json::from_str::<ProgressSnapshot>(&json) {
                    Ok(snapshot) => result.push(snapshot),
                    Err(e) => warn!(job_id, key, error = %e, "Skipping unparsable progress entry"),
                }
            }
        }
        result.sort_by_key(|s| s.work_unit);
        Ok(result)
    }
}
