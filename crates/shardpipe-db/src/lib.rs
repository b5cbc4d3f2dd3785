//! # shardpipe-db
//!
//! PostgreSQL persistence layer for shardpipe.
//!
//! This crate provides:
//! - Connection pool management
//! - The coordination store implementation (job configs, progress, check
//!   pointers) over a single key/value table
//! - The pipeline data source implementation (snapshot reads, min/max PK
//!   queries, grouped batch writes)
//! - Always-compiled in-memory fixtures so dependent crates can test the
//!   full pipeline without a live database

pub mod fixtures;
pub mod pool;
pub mod source;
pub mod store;

// Re-export core types
pub use shardpipe_core::*;

pub use pool::PoolConfig;
pub use source::PgPipelineDataSource;
pub use store::PgCoordinationStore;

/// Escape LIKE/ILIKE wildcard characters (`%`, `_`, `\`) in user input.
pub fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
