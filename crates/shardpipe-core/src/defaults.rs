//! Centralized default constants for the shardpipe system.
//!
//! **This module is the single source of truth** for all shared default
//! values. All crates reference these constants instead of defining their
//! own magic numbers.

// =============================================================================
// CHANNEL
// =============================================================================

/// Maximum number of in-flight record batches buffered between a reader and
/// its writer. The reader suspends once this many batches are unacknowledged.
pub const CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// MIGRATION
// =============================================================================

/// Default rows per write batch.
pub const WRITE_BATCH_SIZE: usize = 1000;

/// Default rows fetched per read round trip.
pub const READ_BATCH_SIZE: usize = 1000;

/// Default per-batch apply retry limit before a work unit is marked FAILED.
pub const WRITE_MAX_RETRIES: u32 = 3;

/// Backoff between batch apply retries (milliseconds).
pub const WRITE_RETRY_BACKOFF_MS: u64 = 500;

// =============================================================================
// CDC SINK
// =============================================================================

/// How long the CDC sink waits for a client ack before treating the wait as
/// a soft failure (seconds).
pub const CDC_ACK_TIMEOUT_SECS: u64 = 30;

/// Outbound CDC batch queue depth per streaming connection.
pub const CDC_QUEUE_CAPACITY: usize = 32;

// =============================================================================
// CONSISTENCY CHECK
// =============================================================================

/// Rows fetched per comparison round in the consistency check engine.
pub const CHECK_CHUNK_SIZE: usize = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        assert!(CHANNEL_CAPACITY > 0);
        assert!(WRITE_BATCH_SIZE > 0);
        assert!(WRITE_MAX_RETRIES > 0);
    }
}
