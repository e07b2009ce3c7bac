//! Postgres-backed projection store.
//!
//! Products are stored as JSONB documents keyed by `product_id`:
//!
//! | Operation | Statement |
//! |-----------|-----------|
//! | `upsert` | `INSERT ... ON CONFLICT (product_id) DO UPDATE SET document = EXCLUDED.document` |
//! | `merge` | `UPDATE ... SET document = document \|\| $2` |
//! | `remove` | `DELETE ... WHERE product_id = $1` |
//!
//! Every write is one statement on one row, so each is atomic on its own and
//! the affected-row count maps directly onto the store contract.
//!
//! ## Error Mapping
//!
//! Pool, IO, TLS and timeout failures become `StoreError::Connection`;
//! everything else (constraint violations, decode failures) becomes
//! `StoreError::Query`.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use catalog_core::ProductId;
use catalog_events::Payload;
use catalog_products::ProductRecord;

use super::{ProductQuery, ProjectionStore, StoreError};

const MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct PostgresProjectionStore {
    pool: Arc<PgPool>,
}

impl PostgresProjectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a connection pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }
}

#[async_trait::async_trait]
impl ProjectionStore for PostgresProjectionStore {
    #[instrument(skip(self, fields), fields(product_id = %product_id), err)]
    async fn upsert(&self, product_id: &ProductId, fields: &Payload) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO product_projections (product_id, document, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (product_id)
            DO UPDATE SET
                document = EXCLUDED.document,
                updated_at = NOW()
            "#,
        )
        .bind(product_id.as_str())
        .bind(Json(fields))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, fields), fields(product_id = %product_id), err)]
    async fn merge(&self, product_id: &ProductId, fields: &Payload) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE product_projections
            SET document = document || $2,
                updated_at = NOW()
            WHERE product_id = $1
            "#,
        )
        .bind(product_id.as_str())
        .bind(Json(fields))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("merge", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    async fn remove(&self, product_id: &ProductId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM product_projections WHERE product_id = $1")
            .bind(product_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;

        Ok(result.rows_affected())
    }

    async fn get(&self, product_id: &ProductId) -> Result<Option<ProductRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT product_id, document FROM product_projections WHERE product_id = $1",
        )
        .bind(product_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    async fn list(&self, query: &ProductQuery) -> Result<Vec<ProductRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, document
            FROM product_projections
            WHERE ($1::TEXT IS NULL OR document->>'category' = $1)
            ORDER BY product_id ASC
            OFFSET $2
            LIMIT $3
            "#,
        )
        .bind(query.category.as_deref())
        .bind(to_i64(query.skip))
        .bind(to_i64(query.limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS product_projections (
                product_id TEXT PRIMARY KEY,
                document JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS product_projections_category_idx
            ON product_projections ((document->>'category'))
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<ProductRecord, StoreError> {
    let product_id: String = row
        .try_get("product_id")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let Json(fields): Json<Payload> = row
        .try_get("document")
        .map_err(|e| map_sqlx_error("decode_row", e))?;
    let product_id = ProductId::new(product_id)
        .map_err(|e| StoreError::Query(format!("stored product_id is invalid: {e}")))?;

    Ok(ProductRecord::new(product_id, fields))
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::Connection(format!("connection pool unavailable in {operation}: {err}"))
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            StoreError::Connection(format!("connection failure in {operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => {
            StoreError::Query(format!("database error in {operation}: {}", db_err.message()))
        }
        _ => StoreError::Query(format!("sqlx error in {operation}: {err}")),
    }
}
