//! Pipeline engine for shardpipe: live data redistribution between
//! database endpoints.
//!
//! A migration job is split into per-table (and per key-range) work units,
//! each executed as a reader/writer pair connected by an ack-backpressured
//! channel. A coordinator supervises the pairs, persists progress, and
//! serves status queries. On top of migration sit chained consistency-check
//! generations and at-least-once CDC sinks.
//!
//! [`service::PipelineService`] is the intended entry point; the individual
//! components are public for callers composing their own topology.

pub mod algorithm;
pub mod cdc;
pub mod channel;
pub mod check;
pub mod coordinator;
pub mod keys;
pub mod progress;
pub mod reader;
pub mod service;
pub mod splitter;
pub mod writer;

pub use algorithm::{AlgorithmRegistry, RowCountAlgorithm, RowHashAlgorithm};
pub use cdc::{CdcSinkManager, CdcSinkState};
pub use channel::{channel, AckFn, ChannelReceiver, ChannelSender};
pub use check::ConsistencyCheckEngine;
pub use coordinator::{CancelFlag, JobCoordinator};
pub use progress::{ProgressTracker, UnitProgress};
pub use reader::SnapshotReader;
pub use service::PipelineService;
pub use splitter::split;
pub use writer::BatchWriter;
