//! PostgreSQL coordination store implementation.
//!
//! Backed by one `pipeline_store` table of key/JSON-value rows:
//!
//! ```sql
//! CREATE TABLE pipeline_store (
//!     key        TEXT PRIMARY KEY,
//!     value      TEXT NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```

use async_trait::async_trait;
use sqlx::{PgPool, Row as SqlxRow};
use tracing::debug;

use shardpipe_core::{CoordinationStore, Error, Result};

use crate::escape_like;

/// PostgreSQL implementation of [`CoordinationStore`].
pub struct PgCoordinationStore {
    pool: PgPool,
}

impl PgCoordinationStore {
    /// Create a new store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CoordinationStore for PgCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM pipeline_store WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO pipeline_store (key, value, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        debug!(subsystem = "db", component = "store", key, "Stored value");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM pipeline_store WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let pattern = format!("{}%", escape_like(prefix));
        sqlx::query("DELETE FROM pipeline_store WHERE key LIKE $1 ESCAPE '\\'")
            .bind(&pattern)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn list_children(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", escape_like(prefix));
        let rows = sqlx::query(
            "SELECT key FROM pipeline_store WHERE key LIKE $1 ESCAPE '\\' ORDER BY key ASC",
        )
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.into_iter().map(|r| r.get("key")).collect())
    }
}
