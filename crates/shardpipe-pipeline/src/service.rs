//! Facade wiring the coordinator, check engine, and CDC sinks together
//! behind one service surface.

use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use shardpipe_core::{
    CdcRequest, CheckInfo, CoordinationStore, DataChangeBatch, DataRecord, JobStatus,
    MetadataProvider, MigrationJobConfig, PipelineDataSource, ProgressSnapshot, Result,
};

use crate::algorithm::AlgorithmRegistry;
use crate::cdc::{CdcSinkManager, CdcSinkState};
use crate::check::ConsistencyCheckEngine;
use crate::coordinator::JobCoordinator;

/// One pipeline over a source/target pair: migration jobs, consistency
/// checks, and CDC sinks sharing a coordination store.
#[derive(Clone)]
pub struct PipelineService {
    coordinator: JobCoordinator,
    check: ConsistencyCheckEngine,
    cdc: CdcSinkManager,
}

impl PipelineService {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        source: Arc<dyn PipelineDataSource>,
        target: Arc<dyn PipelineDataSource>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> Self {
        Self::with_registry(
            store,
            source,
            target,
            metadata,
            Arc::new(AlgorithmRegistry::with_defaults()),
        )
    }

    /// Build a service with a caller-supplied algorithm registry.
    pub fn with_registry(
        store: Arc<dyn CoordinationStore>,
        source: Arc<dyn PipelineDataSource>,
        target: Arc<dyn PipelineDataSource>,
        metadata: Arc<dyn MetadataProvider>,
        registry: Arc<AlgorithmRegistry>,
    ) -> Self {
        let coordinator = JobCoordinator::new(
            store.clone(),
            source.clone(),
            target.clone(),
            metadata.clone(),
        );
        let check = ConsistencyCheckEngine::new(
            store.clone(),
            source,
            target,
            metadata,
            registry,
        );
        let cdc = CdcSinkManager::new(store);
        Self {
            coordinator,
            check,
            cdc,
        }
    }

    // ---- migration jobs ----

    pub async fn start_migration(&self, config: MigrationJobConfig) -> Result<String> {
        self.coordinator.start(config).await
    }

    pub async fn stop_migration(&self, job_id: &str) -> Result<()> {
        self.coordinator.stop(job_id).await
    }

    pub async fn resume_migration(&self, job_id: &str) -> Result<()> {
        self.coordinator.resume(job_id).await
    }

    /// Drop a job and everything hanging off it, checks included.
    pub async fn drop_job(&self, job_id: &str) -> Result<()> {
        self.coordinator.drop_job(job_id).await
    }

    pub async fn get_progress(&self, job_id: &str) -> Result<Vec<ProgressSnapshot>> {
        self.coordinator.get_progress(job_id).await
    }

    pub async fn job_status(&self, job_id: &str) -> Result<JobStatus> {
        self.coordinator.status(job_id).await
    }

    /// Block until the job settles (used by callers driving jobs to
    /// completion synchronously).
    pub async fn wait_for_job(&self, job_id: &str) {
        self.coordinator.wait_until_terminal(job_id).await
    }

    // ---- consistency checks ----

    pub async fn start_check(&self, job_id: &str, algorithm: &str) -> Result<String> {
        self.check.start_check(job_id, algorithm).await
    }

    pub async fn stop_check(&self, job_id: &str) -> Result<()> {
        self.check.stop_check(job_id).await
    }

    pub async fn resume_check(&self, job_id: &str) -> Result<()> {
        self.check.resume_check(job_id).await
    }

    pub async fn drop_check(&self, job_id: &str) -> Result<()> {
        self.check.drop_check(job_id).await
    }

    pub async fn get_check_info(&self, job_id: &str) -> Result<Vec<CheckInfo>> {
        self.check.get_check_info(job_id).await
    }

    pub async fn wait_for_check(&self, job_id: &str) {
        self.check.wait_until_terminal(job_id).await
    }

    // ---- CDC sinks ----

    pub async fn create_cdc_sink(&self, job_id: &str, request: &CdcRequest) -> Result<()> {
        self.cdc.create(job_id, request).await
    }

    pub async fn start_cdc_stream(
        &self,
        job_id: &str,
    ) -> Result<(Uuid, mpsc::Receiver<DataChangeBatch>)> {
        self.cdc.start(job_id).await
    }

    pub async fn publish_changes(
        &self,
        job_id: &str,
        records: Vec<DataRecord>,
    ) -> Result<Uuid> {
        self.cdc.publish(job_id, records).await
    }

    pub async fn ack_changes(&self, ack_id: Uuid) {
        self.cdc.ack(ack_id).await
    }

    pub async fn stop_cdc_stream(&self, job_id: &str, connection_id: Uuid) -> Result<()> {
        self.cdc.stop(job_id, connection_id).await
    }

    pub async fn drop_cdc_sink(&self, job_id: &str) -> Result<()> {
        self.cdc.drop_sink(job_id).await
    }

    pub async fn cdc_sink_state(&self, job_id: &str) -> Result<CdcSinkState> {
        self.cdc.state(job_id).await
    }
}
