//! Projection store: the read-optimized product documents.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryProjectionStore;
pub use postgres::PostgresProjectionStore;

use std::sync::Arc;

use thiserror::Error;

use catalog_core::ProductId;
use catalog_events::Payload;
use catalog_products::ProductRecord;

/// Page size used when a query doesn't set one.
pub const DEFAULT_PAGE_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached (pool closed, network, timeout).
    #[error("projection store connection error: {0}")]
    Connection(String),

    /// The store was reached but rejected the operation.
    #[error("projection store query error: {0}")]
    Query(String),
}

/// Filter and page for [`ProjectionStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductQuery {
    pub category: Option<String>,
    pub skip: usize,
    pub limit: usize,
}

impl Default for ProductQuery {
    fn default() -> Self {
        Self {
            category: None,
            skip: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl ProductQuery {
    pub fn in_category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            ..Self::default()
        }
    }

    pub fn page(mut self, skip: usize, limit: usize) -> Self {
        self.skip = skip;
        self.limit = limit;
        self
    }
}

/// Document store keyed by `product_id`.
///
/// Write operations return the number of records they affected. Each one is a
/// single atomic operation on one record, so re-applying the same write is
/// harmless. Errors are reserved for dependency failures; a missing record is
/// reported as `Ok(0)`, never as an error.
#[async_trait::async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Insert the record or replace it entirely.
    async fn upsert(&self, product_id: &ProductId, fields: &Payload) -> Result<u64, StoreError>;

    /// Overwrite the listed fields of an existing record.
    async fn merge(&self, product_id: &ProductId, fields: &Payload) -> Result<u64, StoreError>;

    async fn remove(&self, product_id: &ProductId) -> Result<u64, StoreError>;

    async fn get(&self, product_id: &ProductId) -> Result<Option<ProductRecord>, StoreError>;

    /// Records ordered by `product_id`, optionally filtered by category.
    async fn list(&self, query: &ProductQuery) -> Result<Vec<ProductRecord>, StoreError>;

    /// Create the unique key and the category index if missing.
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Release the underlying connections.
    async fn close(&self) {}
}

#[async_trait::async_trait]
impl<S> ProjectionStore for Arc<S>
where
    S: ProjectionStore + ?Sized,
{
    async fn upsert(&self, product_id: &ProductId, fields: &Payload) -> Result<u64, StoreError> {
        (**self).upsert(product_id, fields).await
    }

    async fn merge(&self, product_id: &ProductId, fields: &Payload) -> Result<u64, StoreError> {
        (**self).merge(product_id, fields).await
    }

    async fn remove(&self, product_id: &ProductId) -> Result<u64, StoreError> {
        (**self).remove(product_id).await
    }

    async fn get(&self, product_id: &ProductId) -> Result<Option<ProductRecord>, StoreError> {
        (**self).get(product_id).await
    }

    async fn list(&self, query: &ProductQuery) -> Result<Vec<ProductRecord>, StoreError> {
        (**self).list(query).await
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        (**self).ensure_schema().await
    }

    async fn close(&self) {
        (**self).close().await
    }
}
