//! # shardpipe-core
//!
//! Core types, traits, and abstractions for the shardpipe data pipeline.
//!
//! This crate provides the foundational data structures and trait
//! definitions that the other shardpipe crates depend on: the error
//! taxonomy, the job/work-unit/record data model, and the narrow
//! collaborator interfaces (coordination store, data source, metadata
//! provider, checksum algorithm).

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
