//! Core data model for the shardpipe pipeline.
//!
//! Everything persisted to the coordination store or flowed between pipeline
//! components lives here: job configuration, work units, records, progress
//! snapshots, and consistency-check identifiers and results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;

// =============================================================================
// DATABASE ENGINE TYPES
// =============================================================================

/// Database engine type of a pipeline endpoint.
///
/// Used by checksum algorithms to declare which engines they can compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseType {
    Postgres,
    Mysql,
    Opengauss,
}

impl DatabaseType {
    /// Stable string form used in store keys and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Postgres => "postgres",
            DatabaseType::Mysql => "mysql",
            DatabaseType::Opengauss => "opengauss",
        }
    }
}

/// Connection descriptor for a pipeline endpoint.
///
/// Actual connection opening is the data-source provider's concern; the
/// pipeline only carries the descriptor through configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub url: String,
    pub database_type: DatabaseType,
}

// =============================================================================
// MIGRATION JOB CONFIGURATION
// =============================================================================

/// Tuning knobs for the write side of a migration job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Rows buffered before one grouped write.
    pub write_batch_size: usize,
    /// Rows fetched per read round trip.
    pub read_batch_size: usize,
    /// Per-batch apply retries before the work unit is marked FAILED.
    pub max_retries: u32,
    /// Backoff between apply retries (milliseconds).
    pub retry_backoff_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            write_batch_size: defaults::WRITE_BATCH_SIZE,
            read_batch_size: defaults::READ_BATCH_SIZE,
            max_retries: defaults::WRITE_MAX_RETRIES,
            retry_backoff_ms: defaults::WRITE_RETRY_BACKOFF_MS,
        }
    }
}

/// Configuration of one migration job. Persisted as JSON under the job's
/// config key and treated as immutable once the job has started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJobConfig {
    /// Caller-chosen job id; doubles as the idempotency key for start().
    pub job_id: String,
    pub source: ConnectionDescriptor,
    pub target: ConnectionDescriptor,
    /// Tables to redistribute.
    pub tables: Vec<String>,
    /// Parallel range splits per qualifying table.
    pub concurrency: u32,
    pub sink: SinkConfig,
}

/// Lifecycle status of a migration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Stopped,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Stopped => "stopped",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }
}

// =============================================================================
// WORK UNITS
// =============================================================================

/// Inclusive contiguous primary-key range `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: i64,
    pub upper: i64,
}

impl KeyRange {
    pub fn contains(&self, key: i64) -> bool {
        key >= self.lower && key <= self.upper
    }
}

/// Why a table was not range-split. Recorded on the single fallback unit
/// rather than discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitFallback {
    NoPrimaryKey,
    CompositePrimaryKey,
    NonIntegerPrimaryKey,
}

/// One independently executable slice of a migration job: a whole table, or
/// one key-range of a table.
///
/// Invariant: range-split units for a table partition `[min, max]` with no
/// gaps or overlaps; non-qualifying tables get exactly one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub table: String,
    /// Index of this unit within the job; owns the progress key
    /// `.../offset/{index}`.
    pub index: usize,
    /// Range predicate, absent for non-range-split tables.
    pub range: Option<KeyRange>,
    pub estimated_rows: u64,
    /// Present when the table could not be range-split.
    pub fallback: Option<SplitFallback>,
}

/// Lifecycle status of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnitStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

impl WorkUnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkUnitStatus::Finished | WorkUnitStatus::Failed)
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// One row as an ordered column-name → value map.
///
/// Ordered so that serialized forms (and row hashes derived from them) are
/// stable for identical rows.
pub type Row = BTreeMap<String, JsonValue>;

/// Row-level operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

/// One captured row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub table: String,
    pub op: OpKind,
    /// Row image before the change (updates and deletes).
    pub before: Option<Row>,
    /// Row image after the change (inserts and updates).
    pub after: Option<Row>,
}

impl DataRecord {
    /// Build an insert record from a snapshot row.
    pub fn insert(table: impl Into<String>, after: Row) -> Self {
        Self {
            table: table.into(),
            op: OpKind::Insert,
            before: None,
            after: Some(after),
        }
    }
}

/// Tagged record flowing through a pipeline channel.
///
/// `Finished` signals end-of-stream; it is never counted as data and never
/// triggers an ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Data(DataRecord),
    Finished,
}

// =============================================================================
// PROGRESS
// =============================================================================

/// Finished percentage, clamped to 100.
pub fn percentage(processed: u64, estimated: u64) -> u8 {
    if estimated == 0 {
        return if processed > 0 { 100 } else { 0 };
    }
    (processed.min(estimated) * 100 / estimated) as u8
}

/// Remaining-time estimate in seconds: `(estimated - processed) *
/// elapsed / processed`.
///
/// Unknown (`None`) while `processed == 0`; clamped to `>= 0` at completion.
pub fn remaining_seconds(processed: u64, estimated: u64, elapsed_ms: u64) -> Option<i64> {
    if processed == 0 {
        return None;
    }
    let remaining = estimated.saturating_sub(processed) as f64;
    let rate_ms = elapsed_ms as f64 / processed as f64;
    Some(((remaining * rate_ms / 1000.0) as i64).max(0))
}

/// Per-work-unit progress, persisted under the unit's own offset key.
///
/// `processed_rows` is monotonically non-decreasing until the unit reaches a
/// terminal status. Restart resets it to zero: full-snapshot progress is
/// checkpointed by row count, not last-key-read, so a restarted unit re-reads
/// its entire range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub work_unit: usize,
    pub table: String,
    pub estimated_rows: u64,
    pub processed_rows: u64,
    pub status: WorkUnitStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProgressSnapshot {
    /// Finished percentage for this unit, clamped to 100.
    pub fn percentage(&self) -> u8 {
        percentage(self.processed_rows, self.estimated_rows)
    }

    /// Remaining-time estimate relative to `now`. `None` before the first
    /// acked batch or before the unit has started.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        let started = self.started_at?;
        let end = self.ended_at.unwrap_or(now);
        let elapsed_ms = (end - started).num_milliseconds().max(0) as u64;
        remaining_seconds(self.processed_rows, self.estimated_rows, elapsed_ms)
    }
}

// =============================================================================
// CONSISTENCY CHECK
// =============================================================================

/// Identifier of one check generation, chained to its predecessor.
///
/// Sequence numbers increase monotonically per parent job; the store keeps
/// exactly one latest pointer per parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckJobId {
    pub parent_job_id: String,
    pub sequence: u32,
    /// Previous generation's id, absent for the first check.
    pub previous: Option<String>,
}

impl CheckJobId {
    /// First check generation for a parent.
    pub fn initial(parent_job_id: impl Into<String>) -> Self {
        Self {
            parent_job_id: parent_job_id.into(),
            sequence: 1,
            previous: None,
        }
    }

    /// Next generation chained to `previous`.
    pub fn next(previous: &CheckJobId) -> Self {
        Self {
            parent_job_id: previous.parent_job_id.clone(),
            sequence: previous.sequence + 1,
            previous: Some(previous.marshal()),
        }
    }

    /// Stable string form: `{parent}-check-{sequence}`.
    pub fn marshal(&self) -> String {
        format!("{}-check-{}", self.parent_job_id, self.sequence)
    }

    /// Parse the trailing sequence number out of a marshalled check job id.
    pub fn parse_sequence(check_job_id: &str) -> Option<u32> {
        check_job_id.rsplit('-').next()?.parse().ok()
    }
}

/// Lifecycle status of a check generation.
///
/// FINISHED covers both matched and mismatched outcomes; FAILED is reserved
/// for execution-level crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

impl CheckStatus {
    /// Only terminal states permit a new check generation to start.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckStatus::Finished | CheckStatus::Failed)
    }
}

/// Outcome of comparing one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TableCheckResult {
    Matched,
    Mismatched,
    /// The table was skipped; never counts as a mismatch.
    Ignored { reason: String },
}

impl TableCheckResult {
    pub fn is_ignored(&self) -> bool {
        matches!(self, TableCheckResult::Ignored { .. })
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, TableCheckResult::Matched)
    }
}

/// Persisted progress of one check generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckProgress {
    pub check_job_id: String,
    pub status: CheckStatus,
    pub table_names: Vec<String>,
    pub ignored_table_names: Vec<String>,
    pub records_count: u64,
    pub checked_records_count: u64,
    pub begin_time_millis: i64,
    pub end_time_millis: Option<i64>,
    pub error_message: Option<String>,
}

/// Aggregated report for the latest check generation of a parent job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInfo {
    pub check_job_id: String,
    pub status: CheckStatus,
    pub table_names: String,
    /// `Some(true)` iff every non-ignored table matched; `None` when zero
    /// non-ignored tables were checked.
    pub check_success: Option<bool>,
    /// Comma-joined names of mismatched non-ignored tables.
    pub check_failed_table_names: String,
    pub ignored_table_names: String,
    pub finished_percentage: u8,
    pub duration_seconds: i64,
    pub remaining_seconds: Option<i64>,
    pub error_message: Option<String>,
}

// =============================================================================
// CDC PROTOCOL
// =============================================================================

/// Subscription request opening a CDC stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdcRequest {
    pub database: String,
    /// Schema/table selectors; empty means all captured tables.
    pub tables: Vec<String>,
}

/// Server-pushed batch of change records, tagged with an opaque ack id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChangeBatch {
    pub ack_id: Uuid,
    pub records: Vec<DataRecord>,
}

/// Client acknowledgment of a durably applied batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdcAck {
    pub ack_id: Uuid,
}

/// Client request to stop a CDC stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdcStop {
    pub streaming_id: Uuid,
}
