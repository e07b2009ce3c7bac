use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use catalog_core::ProductId;
use catalog_events::Payload;
use catalog_products::ProductRecord;

use super::{ProductQuery, ProjectionStore, StoreError};

/// In-memory projection store for tests/dev.
///
/// Supports write-failure injection to exercise the consumer's
/// no-commit-on-failure path.
#[derive(Debug, Default)]
pub struct InMemoryProjectionStore {
    inner: RwLock<HashMap<ProductId, ProductRecord>>,
    failing_writes: AtomicU32,
    closed: AtomicBool,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write operations fail with a connection error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<ProductId, ProductRecord>>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Connection("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<ProductId, ProductRecord>>, StoreError> {
        self.check_injected_failure()?;
        self.inner
            .write()
            .map_err(|_| StoreError::Connection("in-memory store lock poisoned".to_string()))
    }

    fn check_injected_failure(&self) -> Result<(), StoreError> {
        let consumed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StoreError::Connection("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn upsert(&self, product_id: &ProductId, fields: &Payload) -> Result<u64, StoreError> {
        let mut map = self.write()?;
        map.insert(
            product_id.clone(),
            ProductRecord::new(product_id.clone(), fields.clone()),
        );
        Ok(1)
    }

    async fn merge(&self, product_id: &ProductId, fields: &Payload) -> Result<u64, StoreError> {
        let mut map = self.write()?;
        match map.get_mut(product_id) {
            Some(record) => {
                record.merge(fields);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn remove(&self, product_id: &ProductId) -> Result<u64, StoreError> {
        let mut map = self.write()?;
        Ok(u64::from(map.remove(product_id).is_some()))
    }

    async fn get(&self, product_id: &ProductId) -> Result<Option<ProductRecord>, StoreError> {
        Ok(self.read()?.get(product_id).cloned())
    }

    async fn list(&self, query: &ProductQuery) -> Result<Vec<ProductRecord>, StoreError> {
        let map = self.read()?;
        let mut records: Vec<ProductRecord> = map
            .values()
            .filter(|record| match &query.category {
                Some(category) => record.category() == Some(category.as_str()),
                None => true,
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.product_id().cmp(b.product_id()));

        Ok(records.into_iter().skip(query.skip).take(query.limit).collect())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
