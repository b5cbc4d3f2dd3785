//! Coordination store key layout.
//!
//! All pipeline state lives under `/pipeline/jobs/{job_id}/`. Each work unit
//! writes only its own offset key, so concurrent progress writes never
//! conflict.

/// Root prefix of one job's state; deleted wholesale by drop().
pub fn job_prefix(job_id: &str) -> String {
    format!("/pipeline/jobs/{job_id}/")
}

/// Persisted job configuration.
pub fn job_config(job_id: &str) -> String {
    format!("/pipeline/jobs/{job_id}/config")
}

/// Persisted job status.
pub fn job_status(job_id: &str) -> String {
    format!("/pipeline/jobs/{job_id}/status")
}

/// One work unit's progress snapshot, owned by that unit alone.
pub fn unit_offset(job_id: &str, unit_index: usize) -> String {
    format!("/pipeline/jobs/{job_id}/offset/{unit_index}")
}

/// Prefix of all work-unit offsets of a job.
pub fn unit_offset_prefix(job_id: &str) -> String {
    format!("/pipeline/jobs/{job_id}/offset/")
}

/// The parent's single latest-check pointer.
pub fn check_latest(parent_job_id: &str) -> String {
    format!("/pipeline/jobs/{parent_job_id}/check/latest")
}

/// Registry entry of one check generation id.
pub fn check_id(parent_job_id: &str, check_job_id: &str) -> String {
    format!("/pipeline/jobs/{parent_job_id}/check/ids/{check_job_id}")
}

/// Prefix of all check generation ids of a parent.
pub fn check_id_prefix(parent_job_id: &str) -> String {
    format!("/pipeline/jobs/{parent_job_id}/check/ids/")
}

/// Per-table results of one check generation.
pub fn check_result(parent_job_id: &str, check_job_id: &str) -> String {
    format!("/pipeline/jobs/{parent_job_id}/check/results/{check_job_id}")
}

/// Progress of one check generation.
pub fn check_progress(parent_job_id: &str, check_job_id: &str) -> String {
    format!("/pipeline/jobs/{parent_job_id}/check/progress/{check_job_id}")
}

/// Persisted CDC sink configuration.
pub fn cdc_config(job_id: &str) -> String {
    format!("/pipeline/jobs/{job_id}/cdc/config")
}
