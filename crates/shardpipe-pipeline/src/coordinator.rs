//! Job coordinator: persists configuration, supervises work-unit pairs,
//! and serves progress queries.
//!
//! Each work unit runs as one reader/writer pair connected by one channel;
//! at most `concurrency` pairs run at a time, gated by a semaphore. The
//! coordinator aggregates completion and failure across pairs: an execution
//! error is recorded on the failing unit and never aborts its siblings.
//! Cancellation is cooperative — stop() raises a flag that units check
//! between batches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use shardpipe_core::{
    defaults, CoordinationStore, Error, JobStatus, MetadataProvider, MigrationJobConfig,
    PipelineDataSource, ProgressSnapshot, Result, WorkUnitStatus,
};

use crate::channel::{channel, AckFn};
use crate::keys;
use crate::progress::ProgressTracker;
use crate::reader::SnapshotReader;
use crate::splitter;
use crate::writer::BatchWriter;

/// Shared cooperative cancellation flag, checked only between batches.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct ActiveJob {
    cancel: CancelFlag,
    tracker: Arc<ProgressTracker>,
}

/// Coordinator for migration jobs over one source/target pair.
#[derive(Clone)]
pub struct JobCoordinator {
    store: Arc<dyn CoordinationStore>,
    source: Arc<dyn PipelineDataSource>,
    target: Arc<dyn PipelineDataSource>,
    metadata: Arc<dyn MetadataProvider>,
    active: Arc<RwLock<HashMap<String, ActiveJob>>>,
}

impl JobCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        source: Arc<dyn PipelineDataSource>,
        target: Arc<dyn PipelineDataSource>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> Self {
        Self {
            store,
            source,
            target,
            metadata,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a new migration job. The job id doubles as an idempotency
    /// key: a duplicate id is rejected with a conflict before anything is
    /// persisted.
    pub async fn start(&self, config: MigrationJobConfig) -> Result<String> {
        let job_id = config.job_id.clone();
        if self.active.read().await.contains_key(&job_id) {
            return Err(Error::Conflict(format!("job already active: {job_id}")));
        }
        if self.store.get(&keys::job_config(&job_id)).await?.is_some() {
            return Err(Error::Conflict(format!("job already exists: {job_id}")));
        }

        // Split before persisting anything: configuration errors fail fast
        // with no persisted mutation.
        let units = splitter::split(&config, self.metadata.as_ref(), self.source.as_ref())
            .await?;
        let pk_columns = self.integer_pk_columns(&config).await?;

        self.store
            .put(&keys::job_config(&job_id), &serde_json::to_string(&config)?)
            .await?;

        let tracker = Arc::new(ProgressTracker::new(
            job_id.clone(),
            self.store.clone(),
            units,
        ));
        for index in 0..tracker.unit_count() {
            tracker.persist(index).await;
        }

        info!(
            job_id = %job_id,
            work_units = tracker.unit_count(),
            concurrency = config.concurrency,
            "Starting migration job"
        );
        self.launch(config, pk_columns, tracker).await?;
        Ok(job_id)
    }

    /// Re-activate a previously stopped job without recreating its
    /// configuration. Finished units are skipped; the rest restart from
    /// the beginning of their ranges.
    pub async fn resume(&self, job_id: &str) -> Result<()> {
        if self.active.read().await.contains_key(job_id) {
            return Err(Error::Conflict(format!("job already active: {job_id}")));
        }
        let config = self.load_config(job_id).await?;
        let units = splitter::split(&config, self.metadata.as_ref(), self.source.as_ref())
            .await?;
        let pk_columns = self.integer_pk_columns(&config).await?;

        let tracker = Arc::new(ProgressTracker::new(
            job_id.to_string(),
            self.store.clone(),
            units,
        ));
        for snapshot in ProgressTracker::load(job_id, self.store.as_ref()).await? {
            if snapshot.status == WorkUnitStatus::Finished {
                tracker.restore(&snapshot).await;
            }
        }

        info!(job_id, "Resuming migration job");
        self.launch(config, pk_columns, tracker).await
    }

    /// Signal a running job to stop after in-flight batches complete.
    pub async fn stop(&self, job_id: &str) -> Result<()> {
        let active = self.active.read().await;
        let job = active
            .get(job_id)
            .ok_or_else(|| Error::NotFound(format!("active job: {job_id}")))?;
        job.cancel.cancel();
        info!(job_id, "Stop requested, units will halt after in-flight batches");
        Ok(())
    }

    /// Stop the job if running, then purge its configuration and progress.
    pub async fn drop_job(&self, job_id: &str) -> Result<()> {
        let existing = self.active.write().await.remove(job_id);
        if let Some(job) = &existing {
            job.cancel.cancel();
        }
        if existing.is_none() && self.store.get(&keys::job_config(job_id)).await?.is_none() {
            return Err(Error::NotFound(format!("job: {job_id}")));
        }
        // Give cancelled units a moment to settle before the purge; their
        // progress keys are deleted regardless.
        if existing.is_some() {
            self.wait_until_terminal(job_id).await;
        }
        self.store.delete_prefix(&keys::job_prefix(job_id)).await?;
        info!(job_id, "Dropped job and purged state");
        Ok(())
    }

    /// One snapshot per work unit. Live for active jobs, persisted
    /// otherwise; never errors on missing sub-state.
    pub async fn get_progress(&self, job_id: &str) -> Result<Vec<ProgressSnapshot>> {
        if let Some(job) = self.active.read().await.get(job_id) {
            return Ok(job.tracker.snapshots().await);
        }
        if self.store.get(&keys::job_config(job_id)).await?.is_none() {
            return Err(Error::NotFound(format!("job: {job_id}")));
        }
        ProgressTracker::load(job_id, self.store.as_ref()).await
    }

    /// Persisted job status, defaulting to Pending before the first report.
    pub async fn status(&self, job_id: &str) -> Result<JobStatus> {
        match self.store.get(&keys::job_status(job_id)).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(JobStatus::Pending),
        }
    }

    /// Block until the job reaches a terminal or stopped status.
    pub async fn wait_until_terminal(&self, job_id: &str) {
        loop {
            match self.status(job_id).await {
                Ok(JobStatus::Finished | JobStatus::Failed | JobStatus::Stopped) => return,
                Ok(_) => sleep(Duration::from_millis(10)).await,
                Err(_) => return,
            }
        }
    }

    async fn load_config(&self, job_id: &str) -> Result<MigrationJobConfig> {
        let json = self
            .store
            .get(&keys::job_config(job_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("job: {job_id}")))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Map of table → its single integer primary-key column, where one
    /// exists. Used by readers for ordered paging.
    async fn integer_pk_columns(
        &self,
        config: &MigrationJobConfig,
    ) -> Result<HashMap<String, String>> {
        let mut result = HashMap::new();
        for table in &config.tables {
            let pk = self.metadata.primary_key(table).await?;
            if let [single] = pk.as_slice() {
                if single.column_type.is_integer() {
                    result.insert(table.clone(), single.name.clone());
                }
            }
        }
        Ok(result)
    }

    async fn launch(
        &self,
        config: MigrationJobConfig,
        pk_columns: HashMap<String, String>,
        tracker: Arc<ProgressTracker>,
    ) -> Result<()> {
        let job_id = config.job_id.clone();
        let cancel = CancelFlag::new();
        self.persist_status(&job_id, JobStatus::Running).await;

        self.active.write().await.insert(
            job_id.clone(),
            ActiveJob {
                cancel: cancel.clone(),
                tracker: tracker.clone(),
            },
        );

        let runtime = Arc::new(JobRuntime {
            config,
            pk_columns,
            source: self.source.clone(),
            target: self.target.clone(),
            tracker,
            cancel,
        });
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.supervise(runtime).await;
        });
        Ok(())
    }

    /// Run all non-finished units under the concurrency gate, then record
    /// the aggregate job outcome and retire the active entry.
    async fn supervise(&self, runtime: Arc<JobRuntime>) {
        let job_id = runtime.config.job_id.clone();
        let gate = Arc::new(Semaphore::new(runtime.config.concurrency as usize));
        let mut tasks = JoinSet::new();

        for index in 0..runtime.tracker.unit_count() {
            let status = runtime.tracker.unit(index).snapshot().await.status;
            if status == WorkUnitStatus::Finished {
                continue;
            }
            let runtime = runtime.clone();
            let gate = gate.clone();
            tasks.spawn(async move {
                let _permit = gate.acquire_owned().await;
                runtime.run_unit(index).await;
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(job_id = %job_id, error = ?e, "Work unit task panicked");
            }
        }

        let snapshots = runtime.tracker.snapshots().await;
        let status = if runtime.cancel.is_cancelled() {
            JobStatus::Stopped
        } else if snapshots.iter().any(|s| s.status == WorkUnitStatus::Failed) {
            JobStatus::Failed
        } else {
            JobStatus::Finished
        };
        self.persist_status(&job_id, status).await;
        self.active.write().await.remove(&job_id);
        info!(job_id = %job_id, status = status.as_str(), "Migration job settled");
    }

    async fn persist_status(&self, job_id: &str, status: JobStatus) {
        match serde_json::to_string(&status) {
            Ok(json) => {
                if let Err(e) = self.store.put(&keys::job_status(job_id), &json).await {
                    warn!(job_id, error = %e, "Failed to persist job status");
                }
            }
            Err(e) => warn!(job_id, error = %e, "Failed to serialize job status"),
        }
    }
}

/// Everything one job's unit tasks need, shared behind an Arc.
struct JobRuntime {
    config: MigrationJobConfig,
    pk_columns: HashMap<String, String>,
    source: Arc<dyn PipelineDataSource>,
    target: Arc<dyn PipelineDataSource>,
    tracker: Arc<ProgressTracker>,
    cancel: CancelFlag,
}

impl JobRuntime {
    /// Execute one reader/writer pair to completion and record the unit's
    /// outcome. Failures stay on this unit.
    async fn run_unit(&self, index: usize) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.tracker.mark_running(index).await;

        let progress = self.tracker.unit(index);
        let unit = progress.unit().clone();
        let on_ack: AckFn = {
            let progress = progress.clone();
            Arc::new(move |records| progress.add_processed(records))
        };
        let (tx, rx) = channel(defaults::CHANNEL_CAPACITY, on_ack);

        let reader = SnapshotReader::new(
            self.source.clone(),
            unit.clone(),
            self.pk_columns.get(&unit.table).cloned(),
            self.config.sink.read_batch_size,
        );
        let writer = BatchWriter::new(self.target.clone(), self.config.sink.clone());

        let reader_task = tokio::spawn(reader.run(tx, self.cancel.clone()));
        let writer_result = writer.run(rx, self.cancel.clone()).await;
        let reader_result = match reader_task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("reader task panicked: {e}"))),
        };

        match (reader_result, writer_result) {
            (Ok(()), Ok(())) => {
                if self.cancel.is_cancelled() {
                    // Cooperative stop: the unit is not terminal and will
                    // restart from the beginning of its range on resume.
                    self.tracker.persist(index).await;
                } else {
                    self.tracker.mark_finished(index).await;
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                if self.cancel.is_cancelled() {
                    // A cooperative stop can sever the channel mid-stream:
                    // the writer exits and drops its receiver while the
                    // reader is still pushing. That is a clean halt, not a
                    // unit failure; the unit restarts from the beginning of
                    // its range on resume.
                    info!(
                        job_id = %self.config.job_id,
                        work_unit = index,
                        table = %unit.table,
                        "Work unit halted by stop request"
                    );
                    self.tracker.persist(index).await;
                } else {
                    error!(
                        job_id = %self.config.job_id,
                        work_unit = index,
                        table = %unit.table,
                        error = %e,
                        "Work unit failed"
                    );
                    self.tracker.mark_failed(index, e.to_string()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use shardpipe_db::fixtures::{
        sequential_rows, MemoryCoordinationStore, MemoryDataSource, MemoryMetadataProvider,
    };
    use shardpipe_core::{ConnectionDescriptor, DatabaseType, SinkConfig};

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            url: "postgres://test".into(),
            database_type: DatabaseType::Postgres,
        }
    }

    fn config(job_id: &str, tables: &[&str], concurrency: u32) -> MigrationJobConfig {
        MigrationJobConfig {
            job_id: job_id.into(),
            source: descriptor(),
            target: descriptor(),
            tables: tables.iter().map(|t| t.to_string()).collect(),
            concurrency,
            sink: SinkConfig {
                write_batch_size: 100,
                read_batch_size: 100,
                max_retries: 1,
                retry_backoff_ms: 1,
            },
        }
    }

    async fn setup(rows: usize) -> (JobCoordinator, Arc<MemoryDataSource>, Arc<MemoryDataSource>) {
        let store = Arc::new(MemoryCoordinationStore::new());
        let source = MemoryDataSource::postgres();
        let target = MemoryDataSource::postgres();
        source
            .load_table("orders", sequential_rows("id", 1, rows))
            .await;
        target.load_table("orders", vec![]).await;
        let metadata = Arc::new(MemoryMetadataProvider::new().with_integer_pk("orders", "id"));
        let coordinator =
            JobCoordinator::new(store, source.clone(), target.clone(), metadata);
        (coordinator, source, target)
    }

    #[tokio::test]
    async fn test_full_migration_round_trip() {
        let (coordinator, source, target) = setup(1000).await;
        coordinator
            .start(config("j1", &["orders"], 4))
            .await
            .unwrap();
        coordinator.wait_until_terminal("j1").await;

        assert_eq!(coordinator.status("j1").await.unwrap(), JobStatus::Finished);
        assert_eq!(
            target.rows("orders", Some("id")).await,
            source.rows("orders", Some("id")).await
        );

        let progress = coordinator.get_progress("j1").await.unwrap();
        assert_eq!(progress.len(), 4);
        let processed: u64 = progress.iter().map(|p| p.processed_rows).sum();
        let estimated: u64 = progress.iter().map(|p| p.estimated_rows).sum();
        assert_eq!(processed, 1000);
        assert_eq!(estimated, 1000);
        assert!(progress.iter().all(|p| p.percentage() == 100));
    }

    #[tokio::test]
    async fn test_duplicate_job_id_conflicts() {
        let (coordinator, _, _) = setup(10).await;
        coordinator
            .start(config("j1", &["orders"], 2))
            .await
            .unwrap();
        let err = coordinator
            .start(config("j1", &["orders"], 2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        coordinator.wait_until_terminal("j1").await;
    }

    #[tokio::test]
    async fn test_config_error_persists_nothing() {
        let (coordinator, _, _) = setup(10).await;
        let err = coordinator
            .start(config("j1", &["orders"], 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        // Nothing persisted: the job is unknown afterwards.
        assert!(matches!(
            coordinator.get_progress("j1").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_unit_does_not_abort_siblings() {
        let (coordinator, _, target) = setup(100).await;
        // One injected failure with zero retries: whichever unit hits it
        // fails, the other three finish.
        target.fail_next_applies(1);
        let mut cfg = config("j1", &["orders"], 4);
        cfg.sink.max_retries = 0;
        coordinator.start(cfg).await.unwrap();
        coordinator.wait_until_terminal("j1").await;

        assert_eq!(coordinator.status("j1").await.unwrap(), JobStatus::Failed);
        let progress = coordinator.get_progress("j1").await.unwrap();
        let failed = progress
            .iter()
            .filter(|p| p.status == WorkUnitStatus::Failed)
            .count();
        let finished = progress
            .iter()
            .filter(|p| p.status == WorkUnitStatus::Finished)
            .count();
        assert_eq!(failed, 1);
        assert_eq!(finished, 3);
    }

    #[tokio::test]
    async fn test_drop_job_purges_state() {
        let (coordinator, _, _) = setup(50).await;
        coordinator
            .start(config("j1", &["orders"], 2))
            .await
            .unwrap();
        coordinator.wait_until_terminal("j1").await;
        coordinator.drop_job("j1").await.unwrap();

        assert!(matches!(
            coordinator.get_progress("j1").await.unwrap_err(),
            Error::NotFound(_)
        ));
        // Dropping again is NotFound.
        assert!(matches!(
            coordinator.drop_job("j1").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_resume_skips_finished_units() {
        let (coordinator, _, target) = setup(100).await;
        coordinator
            .start(config("j1", &["orders"], 4))
            .await
            .unwrap();
        coordinator.wait_until_terminal("j1").await;

        // Resume after completion: every unit is already Finished, so the
        // job settles immediately without duplicating rows.
        coordinator.resume("j1").await.unwrap();
        coordinator.wait_until_terminal("j1").await;
        assert_eq!(coordinator.status("j1").await.unwrap(), JobStatus::Finished);
        assert_eq!(target.rows("orders", Some("id")).await.len(), 100);
    }

    #[tokio::test]
    async fn test_stop_never_marks_units_failed() {
        // Stop while units are mid-stream. The writer can exit its stop
        // branch and drop the channel before the reader has pushed its
        // end-of-stream marker; that severed channel must settle the unit
        // as a clean halt, never as Failed.
        let (coordinator, _, _) = setup(5000).await;
        let mut cfg = config("j1", &["orders"], 4);
        cfg.sink.read_batch_size = 10;
        cfg.sink.write_batch_size = 10;
        coordinator.start(cfg).await.unwrap();
        let _ = coordinator.stop("j1").await;
        coordinator.wait_until_terminal("j1").await;

        let progress = coordinator.get_progress("j1").await.unwrap();
        assert!(
            progress
                .iter()
                .all(|p| p.status != WorkUnitStatus::Failed),
            "stopped units must not be recorded as failures"
        );
        assert!(matches!(
            coordinator.status("j1").await.unwrap(),
            JobStatus::Stopped | JobStatus::Finished
        ));
    }

    #[tokio::test]
    async fn test_stop_unknown_job_not_found() {
        let (coordinator, _, _) = setup(10).await;
        assert!(matches!(
            coordinator.stop("ghost").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
