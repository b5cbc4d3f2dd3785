//! In-memory fixtures for pipeline tests.
//!
//! Always compiled (not `#[cfg(test)]`) so integration tests in dependent
//! crates can drive the whole pipeline without a live PostgreSQL instance.
//! The fixtures implement the same core traits as the Pg implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use shardpipe_core::{
    ColumnType, CoordinationStore, DataRecord, DatabaseType, Error, KeyRange, MetadataProvider,
    OpKind, PipelineDataSource, PkColumn, Result, Row,
};

// =============================================================================
// COORDINATION STORE
// =============================================================================

/// In-memory [`CoordinationStore`] over a `BTreeMap` (keys come back in
/// ascending order, matching the Pg implementation's `ORDER BY key`).
#[derive(Default)]
pub struct MemoryCoordinationStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys (for assertions).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    async fn list_children(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// =============================================================================
// DATA SOURCE
// =============================================================================

/// In-memory [`PipelineDataSource`] over per-table row vectors.
///
/// Supports injected apply failures so writer retry paths can be exercised.
pub struct MemoryDataSource {
    database_type: DatabaseType,
    tables: RwLock<HashMap<String, Vec<Row>>>,
    /// Remaining apply calls that will fail with an execution error.
    failing_applies: AtomicU32,
}

impl MemoryDataSource {
    pub fn new(database_type: DatabaseType) -> Self {
        Self {
            database_type,
            tables: RwLock::new(HashMap::new()),
            failing_applies: AtomicU32::new(0),
        }
    }

    /// Shorthand for the common Postgres-flavored fixture.
    pub fn postgres() -> Arc<Self> {
        Arc::new(Self::new(DatabaseType::Postgres))
    }

    /// Replace the contents of `table`.
    pub async fn load_table(&self, table: &str, rows: Vec<Row>) {
        self.tables.write().await.insert(table.to_string(), rows);
    }

    /// Current rows of `table` (for assertions), sorted by `pk` when given.
    pub async fn rows(&self, table: &str, pk: Option<&str>) -> Vec<Row> {
        let mut rows = self
            .tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default();
        if let Some(pk) = pk {
            rows.sort_by_key(|r| int_column(r, pk).unwrap_or(i64::MIN));
        }
        rows
    }

    /// Make the next `n` apply_batch calls fail.
    pub fn fail_next_applies(&self, n: u32) {
        self.failing_applies.store(n, Ordering::SeqCst);
    }
}

/// Read an integer column out of a JSON row.
fn int_column(row: &Row, column: &str) -> Option<i64> {
    row.get(column).and_then(JsonValue::as_i64)
}

#[async_trait]
impl PipelineDataSource for MemoryDataSource {
    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    async fn count_estimate(&self, table: &str) -> Result<u64> {
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0))
    }

    async fn min_max_integer_pk(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Option<(i64, i64)>> {
        let tables = self.tables.read().await;
        let rows = tables
            .get(table)
            .ok_or_else(|| Error::NotFound(format!("table: {table}")))?;
        let keys: Vec<i64> = rows.iter().filter_map(|r| int_column(r, column)).collect();
        Ok(keys
            .iter()
            .min()
            .copied()
            .zip(keys.iter().max().copied()))
    }

    async fn fetch_rows(
        &self,
        table: &str,
        pk_column: Option<&str>,
        range: Option<KeyRange>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let tables = self.tables.read().await;
        let rows = tables
            .get(table)
            .ok_or_else(|| Error::NotFound(format!("table: {table}")))?;
        let mut selected: Vec<Row> = rows
            .iter()
            .filter(|r| match (pk_column, range) {
                (Some(pk), Some(range)) => {
                    int_column(r, pk).map(|k| range.contains(k)).unwrap_or(false)
                }
                _ => true,
            })
            .cloned()
            .collect();
        if let Some(pk) = pk_column {
            selected.sort_by_key(|r| int_column(r, pk).unwrap_or(i64::MIN));
        }
        Ok(selected
            .into_iter()
            .skip(offset as usize)
            .take(limit)
            .collect())
    }

    async fn apply_batch(&self, records: &[DataRecord]) -> Result<()> {
        let remaining = self.failing_applies.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_applies.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Execution("injected apply failure".into()));
        }

        let mut tables = self.tables.write().await;
        for record in records {
            let rows = tables.entry(record.table.clone()).or_default();
            match record.op {
                OpKind::Insert => {
                    let after = record.after.clone().ok_or_else(|| {
                        Error::Execution("insert record missing after image".into())
                    })?;
                    // Redelivered inserts are idempotent, matching the Pg
                    // implementation's ON CONFLICT DO NOTHING.
                    if !rows.contains(&after) {
                        rows.push(after);
                    }
                }
                OpKind::Update => {
                    let before = record.before.as_ref().ok_or_else(|| {
                        Error::Execution("update record missing before image".into())
                    })?;
                    let after = record.after.clone().ok_or_else(|| {
                        Error::Execution("update record missing after image".into())
                    })?;
                    rows.retain(|r| r != before);
                    rows.push(after);
                }
                OpKind::Delete => {
                    let before = record.before.as_ref().ok_or_else(|| {
                        Error::Execution("delete record missing before image".into())
                    })?;
                    rows.retain(|r| r != before);
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// METADATA PROVIDER
// =============================================================================

/// In-memory [`MetadataProvider`] with explicit per-table primary keys.
#[derive(Default)]
pub struct MemoryMetadataProvider {
    primary_keys: HashMap<String, Vec<PkColumn>>,
    table_order: Vec<String>,
}

impl MemoryMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with a single integer primary key column.
    pub fn with_integer_pk(mut self, table: &str, column: &str) -> Self {
        self.table_order.push(table.to_string());
        self.primary_keys.insert(
            table.to_string(),
            vec![PkColumn {
                name: column.to_string(),
                column_type: ColumnType::Integer,
            }],
        );
        self
    }

    /// Register a table with arbitrary primary-key columns (empty = no PK).
    pub fn with_pk(mut self, table: &str, columns: Vec<PkColumn>) -> Self {
        self.table_order.push(table.to_string());
        self.primary_keys.insert(table.to_string(), columns);
        self
    }
}

#[async_trait]
impl MetadataProvider for MemoryMetadataProvider {
    async fn tables(&self) -> Result<Vec<String>> {
        Ok(self.table_order.clone())
    }

    async fn primary_key(&self, table: &str) -> Result<Vec<PkColumn>> {
        self.primary_keys
            .get(table)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("table: {table}")))
    }
}

/// Build a JSON row from integer column values.
pub fn int_row(pairs: &[(&str, i64)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), JsonValue::from(*v)))
        .collect()
}

/// Generate `count` sequential rows `{pk: lower.., payload: ...}` for tests.
pub fn sequential_rows(pk: &str, lower: i64, count: usize) -> Vec<Row> {
    (0..count as i64)
        .map(|i| int_row(&[(pk, lower + i), ("payload", (lower + i) * 10)]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCoordinationStore::new();
        store.put("/pipeline/jobs/j1/config", "{}").await.unwrap();
        assert_eq!(
            store.get("/pipeline/jobs/j1/config").await.unwrap(),
            Some("{}".to_string())
        );
        store.delete("/pipeline/jobs/j1/config").await.unwrap();
        assert_eq!(store.get("/pipeline/jobs/j1/config").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_list_children_ordered() {
        let store = MemoryCoordinationStore::new();
        store.put("/a/2", "x").await.unwrap();
        store.put("/a/1", "x").await.unwrap();
        store.put("/b/1", "x").await.unwrap();
        let children = store.list_children("/a/").await.unwrap();
        assert_eq!(children, vec!["/a/1".to_string(), "/a/2".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_store_delete_prefix() {
        let store = MemoryCoordinationStore::new();
        store.put("/a/1", "x").await.unwrap();
        store.put("/a/2", "x").await.unwrap();
        store.put("/b/1", "x").await.unwrap();
        store.delete_prefix("/a/").await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_source_min_max() {
        let source = MemoryDataSource::postgres();
        source
            .load_table("orders", sequential_rows("id", 1, 1000))
            .await;
        assert_eq!(
            source.min_max_integer_pk("orders", "id").await.unwrap(),
            Some((1, 1000))
        );
    }

    #[tokio::test]
    async fn test_memory_source_min_max_empty_table() {
        let source = MemoryDataSource::postgres();
        source.load_table("empty", vec![]).await;
        assert_eq!(
            source.min_max_integer_pk("empty", "id").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_memory_source_fetch_range() {
        let source = MemoryDataSource::postgres();
        source
            .load_table("orders", sequential_rows("id", 1, 100))
            .await;
        let rows = source
            .fetch_rows(
                "orders",
                Some("id"),
                Some(KeyRange { lower: 11, upper: 20 }),
                0,
                100,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(int_column(&rows[0], "id"), Some(11));
        assert_eq!(int_column(&rows[9], "id"), Some(20));
    }

    #[tokio::test]
    async fn test_memory_source_apply_and_fail_injection() {
        let source = MemoryDataSource::postgres();
        source.load_table("orders", vec![]).await;
        source.fail_next_applies(1);

        let batch = vec![DataRecord::insert("orders", int_row(&[("id", 1)]))];
        assert!(source.apply_batch(&batch).await.is_err());
        // Next attempt succeeds
        source.apply_batch(&batch).await.unwrap();
        assert_eq!(source.rows("orders", Some("id")).await.len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_provider() {
        let meta = MemoryMetadataProvider::new()
            .with_integer_pk("orders", "id")
            .with_pk("logs", vec![]);
        assert_eq!(meta.tables().await.unwrap(), vec!["orders", "logs"]);
        assert_eq!(meta.primary_key("orders").await.unwrap().len(), 1);
        assert!(meta.primary_key("logs").await.unwrap().is_empty());
        assert!(meta.primary_key("missing").await.is_err());
    }
}
