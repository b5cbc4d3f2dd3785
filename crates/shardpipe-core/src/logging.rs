//! Structured logging field name constants for shardpipe.
//!
//! All crates use these constants for consistent structured logging fields
//! so log aggregation tools can query by standardized names across every
//! subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Work unit failed, requires operator attention |
//! | WARN  | Recoverable issue (retry, swallowed lifecycle race) |
//! | INFO  | Lifecycle events (job start/stop/drop), check outcomes |
//! | DEBUG | Decision points (split fallback, batch boundaries) |
//! | TRACE | Per-record iteration |

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize structured logging from `RUST_LOG`, defaulting to `info`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// Migration or check job id.
pub const JOB_ID: &str = "job_id";

/// Parent migration job id (on check and CDC events).
pub const PARENT_JOB_ID: &str = "parent_job_id";

/// Work unit index within a job.
pub const WORK_UNIT: &str = "work_unit";

/// Table being migrated or checked.
pub const TABLE: &str = "table";

/// Number of records in a batch or result.
pub const RECORDS: &str = "records";

/// Check generation sequence number.
pub const SEQUENCE: &str = "sequence";

/// CDC streaming connection id.
pub const CONNECTION_ID: &str = "connection_id";

/// Opaque ack id of a delivered CDC batch.
pub const ACK_ID: &str = "ack_id";

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";
