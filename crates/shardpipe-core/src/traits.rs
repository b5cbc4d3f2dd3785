//! Collaborator traits for shardpipe abstractions.
//!
//! These traits define the narrow interfaces through which the pipeline
//! consumes its external collaborators (coordination store, data sources,
//! metadata, checksum algorithms), enabling pluggable backends and
//! testability.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{DataRecord, DatabaseType, KeyRange, Row, TableCheckResult};

// =============================================================================
// COORDINATION / PERSISTENCE STORE
// =============================================================================

/// Key-value coordination store used for job configs, per-unit progress,
/// the latest-check pointer, and check results.
///
/// Keys are `/`-separated paths; values are JSON documents. Each work unit
/// writes only its own key, so concurrent writers never conflict.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Fetch the value at `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace the value at `key`.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// List full keys starting with `prefix`, in ascending key order.
    async fn list_children(&self, prefix: &str) -> Result<Vec<String>>;
}

// =============================================================================
// DATA SOURCE
// =============================================================================

/// Row-level access to one pipeline endpoint.
///
/// Implementations own connection acquisition and must release query
/// resources on every exit path, including error.
#[async_trait]
pub trait PipelineDataSource: Send + Sync {
    /// Engine type of this endpoint.
    fn database_type(&self) -> DatabaseType;

    /// Estimated row count of `table` (used for progress estimates).
    async fn count_estimate(&self, table: &str) -> Result<u64>;

    /// Min and max of a single integer primary-key column, or `None` for a
    /// zero-row table.
    async fn min_max_integer_pk(&self, table: &str, column: &str)
        -> Result<Option<(i64, i64)>>;

    /// Fetch up to `limit` rows of `table`, optionally filtered to a
    /// primary-key `range`, starting at row `offset` within the filtered
    /// set. Rows are returned in primary-key order when `pk_column` is set.
    async fn fetch_rows(
        &self,
        table: &str,
        pk_column: Option<&str>,
        range: Option<KeyRange>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Apply one batch of records as a single grouped write.
    async fn apply_batch(&self, records: &[DataRecord]) -> Result<()>;
}

// =============================================================================
// METADATA PROVIDER
// =============================================================================

/// Column type classification relevant to range splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
    Decimal,
    Timestamp,
    Other,
}

impl ColumnType {
    pub fn is_integer(&self) -> bool {
        matches!(self, ColumnType::Integer)
    }
}

/// Primary-key column metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkColumn {
    pub name: String,
    pub column_type: ColumnType,
}

/// Table and primary-key metadata for one source dialect.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// All table names visible to the pipeline.
    async fn tables(&self) -> Result<Vec<String>>;

    /// Primary-key columns of `table`, in key order. Empty when the table
    /// has no primary key.
    async fn primary_key(&self, table: &str) -> Result<Vec<PkColumn>>;
}

// =============================================================================
// CONSISTENCY CHECK ALGORITHM
// =============================================================================

/// Pluggable source/target comparison algorithm.
///
/// Algorithms declare the engines they support via
/// [`supported_database_types`](ConsistencyCheckAlgorithm::supported_database_types);
/// the check engine validates both endpoints against that set before any
/// check job is created.
#[async_trait]
pub trait ConsistencyCheckAlgorithm: Send + Sync {
    /// Registry lookup name.
    fn type_name(&self) -> &'static str;

    /// Engines this algorithm can compare.
    fn supported_database_types(&self) -> HashSet<DatabaseType>;

    /// Compare one table between source and target. `pk_column` is the
    /// table's single integer primary key when it has one; algorithms that
    /// require keyed access return [`TableCheckResult::Ignored`] without it.
    async fn compare(
        &self,
        table: &str,
        pk_column: Option<&str>,
        source: &dyn PipelineDataSource,
        target: &dyn PipelineDataSource,
    ) -> Result<TableCheckResult>;

    /// Release any algorithm-held resources. Default: nothing to release.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_is_integer() {
        assert!(ColumnType::Integer.is_integer());
        assert!(!ColumnType::Text.is_integer());
        assert!(!ColumnType::Decimal.is_integer());
    }
}
