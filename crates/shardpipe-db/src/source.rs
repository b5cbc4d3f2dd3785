//! PostgreSQL pipeline data source implementation.
//!
//! Rows cross the trait boundary as JSON documents: reads use `to_jsonb(t)`
//! and writes use `jsonb_populate_record`, so the pipeline never needs
//! per-column type mapping. Deletes and the delete half of updates match on
//! the full before-image via jsonb containment, which is exact for full-row
//! change records.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row as SqlxRow};
use tracing::{debug, trace};

use shardpipe_core::{
    DataRecord, DatabaseType, Error, KeyRange, OpKind, PipelineDataSource, Result, Row,
};

/// Quote a SQL identifier for safe interpolation.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// PostgreSQL implementation of [`PipelineDataSource`].
pub struct PgPipelineDataSource {
    pool: PgPool,
}

impl PgPipelineDataSource {
    /// Create a new data source over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn json_to_row(value: JsonValue) -> Result<Row> {
        match value {
            JsonValue::Object(map) => Ok(map.into_iter().collect()),
            other => Err(Error::Serialization(format!(
                "expected JSON object row, got: {other}"
            ))),
        }
    }

    async fn insert_row<'e, E>(executor: E, table: &str, row: &Row) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let table_ident = quote_ident(table);
        // ON CONFLICT DO NOTHING keeps redelivered batches idempotent for
        // inserts under the at-least-once channel contract.
        let sql = format!(
            "INSERT INTO {table_ident}
             SELECT * FROM jsonb_populate_record(NULL::{table_ident}, $1::jsonb)
             ON CONFLICT DO NOTHING"
        );
        sqlx::query(&sql)
            .bind(JsonValue::Object(row.clone().into_iter().collect()))
            .execute(executor)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_row<'e, E>(executor: E, table: &str, before: &Row) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let table_ident = quote_ident(table);
        let sql = format!("DELETE FROM {table_ident} t WHERE to_jsonb(t) @> $1::jsonb");
        sqlx::query(&sql)
            .bind(JsonValue::Object(before.clone().into_iter().collect()))
            .execute(executor)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}

#[async_trait]
impl PipelineDataSource for PgPipelineDataSource {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn count_estimate(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT count(*) AS n FROM {}", quote_ident(table));
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        let n: i64 = row.get("n");
        Ok(n.max(0) as u64)
    }

    async fn min_max_integer_pk(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Option<(i64, i64)>> {
        let sql = format!(
            "SELECT min({col})::bigint AS lo, max({col})::bigint AS hi FROM {tbl}",
            col = quote_ident(column),
            tbl = quote_ident(table),
        );
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        let lo: Option<i64> = row.get("lo");
        let hi: Option<i64> = row.get("hi");
        Ok(lo.zip(hi))
    }

    async fn fetch_rows(
        &self,
        table: &str,
        pk_column: Option<&str>,
        range: Option<KeyRange>,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let table_ident = quote_ident(table);
        let mut sql = format!("SELECT to_jsonb(t) AS row FROM {table_ident} t");
        if let (Some(pk), Some(_)) = (pk_column, range) {
            sql.push_str(&format!(
                " WHERE t.{} BETWEEN $1 AND $2",
                quote_ident(pk)
            ));
        }
        if let Some(pk) = pk_column {
            sql.push_str(&format!(" ORDER BY t.{}", quote_ident(pk)));
        }
        sql.push_str(&format!(" OFFSET {offset} LIMIT {limit}"));

        let mut query = sqlx::query(&sql);
        if let (Some(_), Some(r)) = (pk_column, range) {
            query = query.bind(r.lower).bind(r.upper);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        trace!(
            subsystem = "db",
            component = "source",
            table,
            records = rows.len(),
            "Fetched row batch"
        );
        rows.into_iter()
            .map(|r| Self::json_to_row(r.get("row")))
            .collect()
    }

    async fn apply_batch(&self, records: &[DataRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        for record in records {
            match record.op {
                OpKind::Insert => {
                    let after = record.after.as_ref().ok_or_else(|| {
                        Error::Execution("insert record missing after image".into())
                    })?;
                    Self::insert_row(&mut *tx, &record.table, after).await?;
                }
                OpKind::Update => {
                    let before = record.before.as_ref().ok_or_else(|| {
                        Error::Execution("update record missing before image".into())
                    })?;
                    let after = record.after.as_ref().ok_or_else(|| {
                        Error::Execution("update record missing after image".into())
                    })?;
                    Self::delete_row(&mut *tx, &record.table, before).await?;
                    Self::insert_row(&mut *tx, &record.table, after).await?;
                }
                OpKind::Delete => {
                    let before = record.before.as_ref().ok_or_else(|| {
                        Error::Execution("delete record missing before image".into())
                    })?;
                    Self::delete_row(&mut *tx, &record.table, before).await?;
                }
            }
        }
        tx.commit().await.map_err(Error::Database)?;
        debug!(
            subsystem = "db",
            component = "source",
            records = records.len(),
            "Applied record batch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_plain() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
    }

    #[test]
    fn test_quote_ident_embedded_quote() {
        assert_eq!(quote_ident("or\"ders"), "\"or\"\"ders\"");
    }
}
