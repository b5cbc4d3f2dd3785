//! Consistency-check algorithms and their registry.
//!
//! Two built-in algorithms ship with the pipeline: `row_count` compares
//! table cardinalities on any supported engine, and `row_hash` compares an
//! order-independent digest of every row on engines with a canonical row
//! serialization. Both report per-table outcomes; neither aborts the whole
//! check generation over a single mismatched table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use shardpipe_core::{
    defaults, ConsistencyCheckAlgorithm, DatabaseType, Error, PipelineDataSource, Result, Row,
    TableCheckResult,
};

/// String-keyed registry of check algorithms.
pub struct AlgorithmRegistry {
    algorithms: HashMap<&'static str, Arc<dyn ConsistencyCheckAlgorithm>>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self {
            algorithms: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in algorithms.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RowCountAlgorithm));
        registry.register(Arc::new(RowHashAlgorithm::default()));
        registry
    }

    pub fn register(&mut self, algorithm: Arc<dyn ConsistencyCheckAlgorithm>) {
        self.algorithms.insert(algorithm.type_name(), algorithm);
    }

    /// Look up an algorithm by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn ConsistencyCheckAlgorithm>> {
        self.algorithms
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("check algorithm '{name}'")))
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// =============================================================================
// ROW COUNT
// =============================================================================

/// Cardinality comparison. Cheap, engine-agnostic, and blind to content
/// drift, so it never ignores a table.
pub struct RowCountAlgorithm;

#[async_trait]
impl ConsistencyCheckAlgorithm for RowCountAlgorithm {
    fn type_name(&self) -> &'static str {
        "row_count"
    }

    fn supported_database_types(&self) -> HashSet<DatabaseType> {
        [
            DatabaseType::Postgres,
            DatabaseType::Mysql,
            DatabaseType::Opengauss,
        ]
        .into_iter()
        .collect()
    }

    async fn compare(
        &self,
        table: &str,
        _pk_column: Option<&str>,
        source: &dyn PipelineDataSource,
        target: &dyn PipelineDataSource,
    ) -> Result<TableCheckResult> {
        let source_count = source.count_estimate(table).await?;
        let target_count = target.count_estimate(table).await?;
        debug!(table, source_count, target_count, "Row-count comparison");
        if source_count == target_count {
            Ok(TableCheckResult::Matched)
        } else {
            Ok(TableCheckResult::Mismatched)
        }
    }
}

// =============================================================================
// ROW HASH
// =============================================================================

/// Order-independent full-content comparison.
///
/// Each row is hashed from its canonical JSON form (column-name ordered) and
/// the per-row digests are XOR-folded, so source and target may stream rows
/// in different physical orders. Requires a single integer primary key for
/// keyed paging; tables without one are ignored, not failed.
pub struct RowHashAlgorithm {
    chunk_size: usize,
}

impl RowHashAlgorithm {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    /// XOR-folded digest and row count of one table on one endpoint.
    async fn table_digest(
        &self,
        endpoint: &dyn PipelineDataSource,
        table: &str,
        pk_column: &str,
    ) -> Result<([u8; 32], u64)> {
        let mut digest = [0u8; 32];
        let mut count = 0u64;
        let mut offset = 0u64;
        loop {
            let rows = endpoint
                .fetch_rows(table, Some(pk_column), None, offset, self.chunk_size)
                .await?;
            if rows.is_empty() {
                break;
            }
            offset += rows.len() as u64;
            count += rows.len() as u64;
            for row in &rows {
                let row_hash = hash_row(row)?;
                for (acc, byte) in digest.iter_mut().zip(row_hash.iter()) {
                    *acc ^= byte;
                }
            }
        }
        Ok((digest, count))
    }
}

impl Default for RowHashAlgorithm {
    fn default() -> Self {
        Self::new(defaults::CHECK_CHUNK_SIZE)
    }
}

fn hash_row(row: &Row) -> Result<[u8; 32]> {
    let json = serde_json::to_vec(row)?;
    let mut hasher = Sha256::new();
    hasher.update(&json);
    Ok(hasher.finalize().into())
}

#[async_trait]
impl ConsistencyCheckAlgorithm for RowHashAlgorithm {
    fn type_name(&self) -> &'static str {
        "row_hash"
    }

    fn supported_database_types(&self) -> HashSet<DatabaseType> {
        [DatabaseType::Postgres, DatabaseType::Opengauss]
            .into_iter()
            .collect()
    }

    async fn compare(
        &self,
        table: &str,
        pk_column: Option<&str>,
        source: &dyn PipelineDataSource,
        target: &dyn PipelineDataSource,
    ) -> Result<TableCheckResult> {
        let pk_column = match pk_column {
            Some(column) => column,
            None => {
                return Ok(TableCheckResult::Ignored {
                    reason: "row_hash requires a single integer primary key".into(),
                })
            }
        };
        let (source_digest, source_count) = self.table_digest(source, table, pk_column).await?;
        let (target_digest, target_count) = self.table_digest(target, table, pk_column).await?;
        debug!(
            table,
            source_count,
            target_count,
            source_digest = %hex::encode(source_digest),
            target_digest = %hex::encode(target_digest),
            "Row-hash comparison"
        );
        if source_count == target_count && source_digest == target_digest {
            Ok(TableCheckResult::Matched)
        } else {
            Ok(TableCheckResult::Mismatched)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use shardpipe_db::fixtures::{int_row, sequential_rows, MemoryDataSource};

    #[test]
    fn test_registry_lookup() {
        let registry = AlgorithmRegistry::with_defaults();
        assert!(registry.lookup("row_count").is_ok());
        assert!(registry.lookup("row_hash").is_ok());
        assert!(matches!(
            registry.lookup("crc32"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_supported_engines() {
        assert!(RowCountAlgorithm
            .supported_database_types()
            .contains(&DatabaseType::Mysql));
        assert!(!RowHashAlgorithm::default()
            .supported_database_types()
            .contains(&DatabaseType::Mysql));
    }

    #[tokio::test]
    async fn test_row_count_matched_and_mismatched() {
        let source = MemoryDataSource::postgres();
        let target = MemoryDataSource::postgres();
        source.load_table("orders", sequential_rows("id", 1, 10)).await;
        target.load_table("orders", sequential_rows("id", 1, 10)).await;

        let algorithm = RowCountAlgorithm;
        let result = algorithm
            .compare("orders", Some("id"), source.as_ref(), target.as_ref())
            .await
            .unwrap();
        assert_eq!(result, TableCheckResult::Matched);

        target.load_table("orders", sequential_rows("id", 1, 9)).await;
        let result = algorithm
            .compare("orders", Some("id"), source.as_ref(), target.as_ref())
            .await
            .unwrap();
        assert_eq!(result, TableCheckResult::Mismatched);
    }

    #[tokio::test]
    async fn test_row_hash_detects_content_drift_row_count_does_not() {
        let source = MemoryDataSource::postgres();
        let target = MemoryDataSource::postgres();
        source
            .load_table("orders", vec![int_row(&[("id", 1), ("qty", 5)])])
            .await;
        // Same cardinality, different content.
        target
            .load_table("orders", vec![int_row(&[("id", 1), ("qty", 6)])])
            .await;

        let count = RowCountAlgorithm
            .compare("orders", Some("id"), source.as_ref(), target.as_ref())
            .await
            .unwrap();
        assert_eq!(count, TableCheckResult::Matched);

        let hash = RowHashAlgorithm::default()
            .compare("orders", Some("id"), source.as_ref(), target.as_ref())
            .await
            .unwrap();
        assert_eq!(hash, TableCheckResult::Mismatched);
    }

    #[tokio::test]
    async fn test_row_hash_is_order_independent() {
        let source = MemoryDataSource::postgres();
        let target = MemoryDataSource::postgres();
        let mut rows = sequential_rows("id", 1, 20);
        source.load_table("orders", rows.clone()).await;
        rows.reverse();
        target.load_table("orders", rows).await;

        // Small chunk size to exercise multi-chunk folding.
        let result = RowHashAlgorithm::new(7)
            .compare("orders", Some("id"), source.as_ref(), target.as_ref())
            .await
            .unwrap();
        assert_eq!(result, TableCheckResult::Matched);
    }

    #[tokio::test]
    async fn test_row_hash_ignores_table_without_pk() {
        let source = MemoryDataSource::postgres();
        let target = MemoryDataSource::postgres();
        source.load_table("events", sequential_rows("id", 1, 5)).await;
        target.load_table("events", sequential_rows("id", 1, 5)).await;

        let result = RowHashAlgorithm::default()
            .compare("events", None, source.as_ref(), target.as_ref())
            .await
            .unwrap();
        assert!(result.is_ignored());
    }
}
