//! Consistency-check engine: chained check generations over one parent job.
//!
//! Each parent migration job carries at most one latest check generation at
//! a time. Generations are numbered sequentially and chained to their
//! predecessor, so dropping the latest relinks the pointer to the newest
//! surviving generation. A generation compares every table of the parent's
//! configuration with a pluggable algorithm; per-table mismatches are
//! recorded, never escalated to a generation failure.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use shardpipe_core::{
    percentage, remaining_seconds, CheckInfo, CheckJobId, CheckProgress, CheckStatus,
    ConsistencyCheckAlgorithm, CoordinationStore, Error, MetadataProvider, MigrationJobConfig,
    PipelineDataSource, Result, TableCheckResult,
};

use crate::algorithm::AlgorithmRegistry;
use crate::coordinator::CancelFlag;
use crate::keys;

/// Persisted record of one check generation: its chained id plus the
/// algorithm it runs with, so resume needs no caller-supplied arguments.
///
/// `execution` identifies the run currently allowed to write this
/// generation's progress and results. Drop and resume invalidate it, so a
/// cancelled executor that drains late cannot resurrect purged keys or
/// scribble over a successor that reuses the same marshalled id.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckGeneration {
    id: CheckJobId,
    algorithm: String,
    execution: Uuid,
}

/// In-flight run of one generation, held while its executor task is alive.
struct RunningCheck {
    execution: Uuid,
    cancel: CancelFlag,
}

/// Engine running consistency checks for migration jobs over one
/// source/target pair.
#[derive(Clone)]
pub struct ConsistencyCheckEngine {
    store: Arc<dyn CoordinationStore>,
    source: Arc<dyn PipelineDataSource>,
    target: Arc<dyn PipelineDataSource>,
    metadata: Arc<dyn MetadataProvider>,
    registry: Arc<AlgorithmRegistry>,
    /// In-flight generations, keyed by parent job id.
    running: Arc<RwLock<HashMap<String, RunningCheck>>>,
}

impl ConsistencyCheckEngine {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        source: Arc<dyn PipelineDataSource>,
        target: Arc<dyn PipelineDataSource>,
        metadata: Arc<dyn MetadataProvider>,
        registry: Arc<AlgorithmRegistry>,
    ) -> Self {
        Self {
            store,
            source,
            target,
            metadata,
            registry,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a new check generation for `parent_job_id`.
    ///
    /// Rejected with a conflict while the latest generation is non-terminal,
    /// and with an unsupported-type error when either endpoint's engine is
    /// outside the algorithm's supported set. Both rejections happen before
    /// anything is persisted.
    pub async fn start_check(
        &self,
        parent_job_id: &str,
        algorithm_name: &str,
    ) -> Result<String> {
        let config = self.load_parent_config(parent_job_id).await?;
        let latest = self.store.get(&keys::check_latest(parent_job_id)).await?;
        if let Some(latest_id) = &latest {
            if let Some(progress) = self.load_progress(parent_job_id, latest_id).await? {
                if !progress.status.is_terminal() {
                    return Err(Error::Conflict(format!(
                        "check already in progress for job {parent_job_id}: {latest_id}"
                    )));
                }
            }
        }

        let algorithm = self.registry.lookup(algorithm_name)?;
        self.validate_endpoints(algorithm.as_ref())?;

        let id = match &latest {
            None => CheckJobId::initial(parent_job_id),
            Some(latest_id) => match self.load_generation(parent_job_id, latest_id).await? {
                Some(generation) => CheckJobId::next(&generation.id),
                // Pointer without a record: rebuild the chain link from the
                // marshalled id alone.
                None => CheckJobId {
                    parent_job_id: parent_job_id.to_string(),
                    sequence: CheckJobId::parse_sequence(latest_id).unwrap_or(0) + 1,
                    previous: Some(latest_id.clone()),
                },
            },
        };
        let check_job_id = id.marshal();

        let execution = Uuid::new_v4();
        let generation = CheckGeneration {
            id,
            algorithm: algorithm_name.to_string(),
            execution,
        };
        self.store
            .put(
                &keys::check_id(parent_job_id, &check_job_id),
                &serde_json::to_string(&generation)?,
            )
            .await?;
        self.store
            .put(&keys::check_latest(parent_job_id), &check_job_id)
            .await?;
        // A reused id must never surface a predecessor's outcome.
        self.store
            .delete(&keys::check_result(parent_job_id, &check_job_id))
            .await?;

        let progress = CheckProgress {
            check_job_id: check_job_id.clone(),
            status: CheckStatus::Pending,
            table_names: config.tables.clone(),
            ignored_table_names: Vec::new(),
            records_count: 0,
            checked_records_count: 0,
            begin_time_millis: Utc::now().timestamp_millis(),
            end_time_millis: None,
            error_message: None,
        };
        self.persist_progress(parent_job_id, &progress).await;

        info!(
            parent_job_id,
            check_job_id = %check_job_id,
            algorithm = algorithm_name,
            "Starting consistency check"
        );
        self.spawn_execution(parent_job_id.to_string(), progress, algorithm, execution)
            .await;
        Ok(check_job_id)
    }

    /// Signal the in-flight generation to stop after the current table.
    /// The generation's status stays Running and can be resumed.
    pub async fn stop_check(&self, parent_job_id: &str) -> Result<()> {
        let running = self.running.read().await;
        let run = running
            .get(parent_job_id)
            .ok_or_else(|| Error::NotFound(format!("active check for job: {parent_job_id}")))?;
        run.cancel.cancel();
        info!(parent_job_id, "Check stop requested");
        Ok(())
    }

    /// Re-run the latest generation unless it already finished.
    pub async fn resume_check(&self, parent_job_id: &str) -> Result<()> {
        let latest = self.latest_check_id(parent_job_id).await?;
        if self.running.read().await.contains_key(parent_job_id) {
            return Err(Error::Conflict(format!(
                "check already in progress for job: {parent_job_id}"
            )));
        }
        if let Some(progress) = self.load_progress(parent_job_id, &latest).await? {
            if progress.status == CheckStatus::Finished {
                info!(parent_job_id, check_job_id = %latest, "Check already finished, nothing to resume");
                return Ok(());
            }
        }
        let mut generation = self
            .load_generation(parent_job_id, &latest)
            .await?
            .ok_or_else(|| Error::NotFound(format!("check generation: {latest}")))?;
        let algorithm = self.registry.lookup(&generation.algorithm)?;
        let config = self.load_parent_config(parent_job_id).await?;

        // New write token: any leftover executor of the previous run goes
        // stale and stops persisting.
        generation.execution = Uuid::new_v4();
        self.store
            .put(
                &keys::check_id(parent_job_id, &latest),
                &serde_json::to_string(&generation)?,
            )
            .await?;

        let progress = CheckProgress {
            check_job_id: latest.clone(),
            status: CheckStatus::Pending,
            table_names: config.tables.clone(),
            ignored_table_names: Vec::new(),
            records_count: 0,
            checked_records_count: 0,
            begin_time_millis: Utc::now().timestamp_millis(),
            end_time_millis: None,
            error_message: None,
        };
        self.persist_progress(parent_job_id, &progress).await;
        self.store
            .delete(&keys::check_result(parent_job_id, &latest))
            .await?;

        info!(parent_job_id, check_job_id = %latest, "Resuming consistency check");
        self.spawn_execution(
            parent_job_id.to_string(),
            progress,
            algorithm,
            generation.execution,
        )
        .await;
        Ok(())
    }

    /// Drop the latest generation: purge its state and relink the latest
    /// pointer to the newest surviving predecessor, or clear the pointer
    /// when none survives.
    pub async fn drop_check(&self, parent_job_id: &str) -> Result<()> {
        let dropped = self.latest_check_id(parent_job_id).await?;
        if let Some(run) = self.running.write().await.remove(parent_job_id) {
            run.cancel.cancel();
        }

        let dropped_sequence = CheckJobId::parse_sequence(&dropped).unwrap_or(0);
        let prefix = keys::check_id_prefix(parent_job_id);
        let mut surviving: Option<(u32, String)> = None;
        for key in self.store.list_children(&prefix).await? {
            let id = key.trim_start_matches(&*prefix).to_string();
            if id == dropped {
                continue;
            }
            if let Some(sequence) = CheckJobId::parse_sequence(&id) {
                if sequence < dropped_sequence
                    && surviving.as_ref().map_or(true, |(s, _)| sequence > *s)
                {
                    surviving = Some((sequence, id));
                }
            }
        }

        match &surviving {
            Some((_, id)) => {
                self.store
                    .put(&keys::check_latest(parent_job_id), id)
                    .await?;
            }
            None => {
                self.store
                    .delete(&keys::check_latest(parent_job_id))
                    .await?;
            }
        }
        self.store
            .delete(&keys::check_id(parent_job_id, &dropped))
            .await?;
        self.store
            .delete(&keys::check_result(parent_job_id, &dropped))
            .await?;
        self.store
            .delete(&keys::check_progress(parent_job_id, &dropped))
            .await?;

        info!(
            parent_job_id,
            dropped = %dropped,
            relinked = surviving.as_ref().map(|(_, id)| id.as_str()).unwrap_or("none"),
            "Dropped check generation"
        );
        Ok(())
    }

    /// Report on the latest generation: one entry per ignored table, then
    /// one aggregate entry.
    pub async fn get_check_info(&self, parent_job_id: &str) -> Result<Vec<CheckInfo>> {
        let latest = self.latest_check_id(parent_job_id).await?;
        let progress = self
            .load_progress(parent_job_id, &latest)
            .await?
            .ok_or_else(|| Error::NotFound(format!("check progress: {latest}")))?;
        let results = self.load_results(parent_job_id, &latest).await?;

        let failed: Vec<&str> = results
            .iter()
            .filter(|(_, r)| matches!(r, TableCheckResult::Mismatched))
            .map(|(t, _)| t.as_str())
            .collect();
        let non_ignored = results.values().filter(|r| !r.is_ignored()).count();
        let check_success = if progress.status == CheckStatus::Finished && non_ignored > 0 {
            Some(failed.is_empty())
        } else {
            None
        };

        let now_millis = Utc::now().timestamp_millis();
        let end_millis = progress.end_time_millis.unwrap_or(now_millis);
        let elapsed_ms = (end_millis - progress.begin_time_millis).max(0) as u64;
        let duration_seconds = elapsed_ms as i64 / 1000;
        let finished_percentage = if progress.status == CheckStatus::Finished {
            100
        } else {
            percentage(progress.checked_records_count, progress.records_count)
        };
        let remaining = if progress.status.is_terminal() {
            Some(0)
        } else {
            remaining_seconds(
                progress.checked_records_count,
                progress.records_count,
                elapsed_ms,
            )
        };

        let mut infos = Vec::new();
        for table in &progress.ignored_table_names {
            let reason = match results.get(table) {
                Some(TableCheckResult::Ignored { reason }) => Some(reason.clone()),
                _ => None,
            };
            infos.push(CheckInfo {
                check_job_id: latest.clone(),
                status: progress.status,
                table_names: table.clone(),
                check_success: None,
                check_failed_table_names: String::new(),
                ignored_table_names: table.clone(),
                finished_percentage,
                duration_seconds,
                remaining_seconds: remaining,
                error_message: reason,
            });
        }
        infos.push(CheckInfo {
            check_job_id: latest,
            status: progress.status,
            table_names: progress.table_names.join(","),
            check_success,
            check_failed_table_names: failed.join(","),
            ignored_table_names: progress.ignored_table_names.join(","),
            finished_percentage,
            duration_seconds,
            remaining_seconds: remaining,
            error_message: progress.error_message,
        });
        Ok(infos)
    }

    /// Block until the latest generation reaches a terminal status.
    pub async fn wait_until_terminal(&self, parent_job_id: &str) {
        loop {
            let Ok(latest) = self.latest_check_id(parent_job_id).await else {
                return;
            };
            match self.load_progress(parent_job_id, &latest).await {
                Ok(Some(progress)) if progress.status.is_terminal() => return,
                Ok(_) => sleep(Duration::from_millis(10)).await,
                Err(_) => return,
            }
        }
    }

    fn validate_endpoints(&self, algorithm: &dyn ConsistencyCheckAlgorithm) -> Result<()> {
        let supported = algorithm.supported_database_types();
        for endpoint in [self.source.database_type(), self.target.database_type()] {
            if !supported.contains(&endpoint) {
                return Err(Error::UnsupportedDatabaseType(format!(
                    "{} is not supported by check algorithm '{}'",
                    endpoint.as_str(),
                    algorithm.type_name()
                )));
            }
        }
        Ok(())
    }

    async fn spawn_execution(
        &self,
        parent_job_id: String,
        progress: CheckProgress,
        algorithm: Arc<dyn ConsistencyCheckAlgorithm>,
        execution: Uuid,
    ) {
        let cancel = CancelFlag::new();
        self.running.write().await.insert(
            parent_job_id.clone(),
            RunningCheck {
                execution,
                cancel: cancel.clone(),
            },
        );
        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .execute(&parent_job_id, progress, algorithm, cancel, execution)
                .await;
            // Retire only our own entry: a cancelled run must not evict a
            // successor that was started in the meantime.
            let mut running = engine.running.write().await;
            if running
                .get(&parent_job_id)
                .map_or(false, |run| run.execution == execution)
            {
                running.remove(&parent_job_id);
            }
        });
    }

    /// Compare every table of the generation, persisting results and
    /// progress as tables complete. Cancellation leaves the generation
    /// Running so it can be resumed. Every persist is gated on `execution`
    /// still being the generation's write token; a superseded run drains
    /// without touching the store.
    async fn execute(
        &self,
        parent_job_id: &str,
        mut progress: CheckProgress,
        algorithm: Arc<dyn ConsistencyCheckAlgorithm>,
        cancel: CancelFlag,
        execution: Uuid,
    ) {
        progress.status = CheckStatus::Running;
        let tables = progress.table_names.clone();
        for table in &tables {
            match self.source.count_estimate(table).await {
                Ok(count) => progress.records_count += count,
                Err(e) => {
                    warn!(parent_job_id, table, error = %e, "Could not estimate table size");
                }
            }
        }
        if !self.owns_generation(parent_job_id, &progress.check_job_id, execution).await {
            return;
        }
        self.persist_progress(parent_job_id, &progress).await;

        let mut results: BTreeMap<String, TableCheckResult> = BTreeMap::new();
        for table in &tables {
            if cancel.is_cancelled() {
                info!(
                    parent_job_id,
                    check_job_id = %progress.check_job_id,
                    "Check stopping cooperatively"
                );
                if self
                    .owns_generation(parent_job_id, &progress.check_job_id, execution)
                    .await
                {
                    self.persist_progress(parent_job_id, &progress).await;
                }
                return;
            }
            let pk_column = match self.single_integer_pk(table).await {
                Ok(column) => column,
                Err(e) => {
                    self.fail(parent_job_id, &mut progress, e, execution).await;
                    return;
                }
            };
            let outcome = algorithm
                .compare(
                    table,
                    pk_column.as_deref(),
                    self.source.as_ref(),
                    self.target.as_ref(),
                )
                .await;
            match outcome {
                Ok(result) => {
                    if result.is_ignored() {
                        progress.ignored_table_names.push(table.clone());
                    } else {
                        progress.checked_records_count +=
                            self.source.count_estimate(table).await.unwrap_or(0);
                    }
                    results.insert(table.clone(), result);
                }
                Err(e) => {
                    self.fail(parent_job_id, &mut progress, e, execution).await;
                    return;
                }
            }
            if !self
                .owns_generation(parent_job_id, &progress.check_job_id, execution)
                .await
            {
                info!(
                    parent_job_id,
                    check_job_id = %progress.check_job_id,
                    "Check generation superseded, discarding run"
                );
                return;
            }
            self.persist_results(parent_job_id, &progress.check_job_id, &results)
                .await;
            self.persist_progress(parent_job_id, &progress).await;
        }

        if let Err(e) = algorithm.close().await {
            warn!(parent_job_id, error = %e, "Check algorithm close failed");
        }
        progress.status = CheckStatus::Finished;
        progress.end_time_millis = Some(Utc::now().timestamp_millis());
        if !self
            .owns_generation(parent_job_id, &progress.check_job_id, execution)
            .await
        {
            return;
        }
        self.persist_progress(parent_job_id, &progress).await;
        info!(
            parent_job_id,
            check_job_id = %progress.check_job_id,
            tables = results.len(),
            ignored = progress.ignored_table_names.len(),
            "Consistency check finished"
        );
    }

    async fn fail(
        &self,
        parent_job_id: &str,
        progress: &mut CheckProgress,
        e: Error,
        execution: Uuid,
    ) {
        error!(
            parent_job_id,
            check_job_id = %progress.check_job_id,
            error = %e,
            "Consistency check failed"
        );
        progress.status = CheckStatus::Failed;
        progress.end_time_millis = Some(Utc::now().timestamp_millis());
        progress.error_message = Some(e.to_string());
        if self
            .owns_generation(parent_job_id, &progress.check_job_id, execution)
            .await
        {
            self.persist_progress(parent_job_id, progress).await;
        }
    }

    /// Whether `execution` is still the generation's write token. False when
    /// the generation was dropped or handed to a newer run.
    async fn owns_generation(
        &self,
        parent_job_id: &str,
        check_job_id: &str,
        execution: Uuid,
    ) -> bool {
        matches!(
            self.load_generation(parent_job_id, check_job_id).await,
            Ok(Some(generation)) if generation.execution == execution
        )
    }

    /// The table's single integer primary-key column, when it has one.
    async fn single_integer_pk(&self, table: &str) -> Result<Option<String>> {
        let pk = self.metadata.primary_key(table).await?;
        if let [single] = pk.as_slice() {
            if single.column_type.is_integer() {
                return Ok(Some(single.name.clone()));
            }
        }
        Ok(None)
    }

    async fn load_parent_config(&self, parent_job_id: &str) -> Result<MigrationJobConfig> {
        let json = self
            .store
            .get(&keys::job_config(parent_job_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("job: {parent_job_id}")))?;
        Ok(serde_json::from_str(&json)?)
    }

    async fn latest_check_id(&self, parent_job_id: &str) -> Result<String> {
        self.store
            .get(&keys::check_latest(parent_job_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("no check for job: {parent_job_id}")))
    }

    async fn load_generation(
        &self,
        parent_job_id: &str,
        check_job_id: &str,
    ) -> Result<Option<CheckGeneration>> {
        match self
            .store
            .get(&keys::check_id(parent_job_id, check_job_id))
            .await?
        {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn load_progress(
        &self,
        parent_job_id: &str,
        check_job_id: &str,
    ) -> Result<Option<CheckProgress>> {
        match self
            .store
            .get(&keys::check_progress(parent_job_id, check_job_id))
            .await?
        {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn load_results(
        &self,
        parent_job_id: &str,
        check_job_id: &str,
    ) -> Result<BTreeMap<String, TableCheckResult>> {
        match self
            .store
            .get(&keys::check_result(parent_job_id, check_job_id))
            .await?
        {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn persist_results(
        &self,
        parent_job_id: &str,
        check_job_id: &str,
        results: &BTreeMap<String, TableCheckResult>,
    ) {
        match serde_json::to_string(results) {
            Ok(json) => {
                if let Err(e) = self
                    .store
                    .put(&keys::check_result(parent_job_id, check_job_id), &json)
                    .await
                {
                    warn!(parent_job_id, check_job_id, error = %e, "Failed to persist check results");
                }
            }
            Err(e) => {
                warn!(parent_job_id, check_job_id, error = %e, "Failed to serialize check results")
            }
        }
    }

    async fn persist_progress(&self, parent_job_id: &str, progress: &CheckProgress) {
        match serde_json::to_string(progress) {
            Ok(json) => {
                if let Err(e) = self
                    .store
                    .put(
                        &keys::check_progress(parent_job_id, &progress.check_job_id),
                        &json,
                    )
                    .await
                {
                    warn!(parent_job_id, error = %e, "Failed to persist check progress");
                }
            }
            Err(e) => warn!(parent_job_id, error = %e, "Failed to serialize check progress"),
        }
    }
}
