//! In-memory request storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use fleet_agent_core::{Operation, Request, RequestStore, StoreError, TransactionRecord};

#[derive(Default)]
struct Inner {
    records: HashMap<String, TransactionRecord>,
    order: Vec<String>,
}

/// In-memory storage implementation.
///
/// Useful for tests and for injecting requests without touching the
/// device configuration. Data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<TransactionRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .records
            .get(key)
            .cloned())
    }

    async fn put(
        &self,
        key: &str,
        request: &Request,
        operations: &[Operation],
    ) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let record = TransactionRecord {
            key: key.to_string(),
            request: request.clone(),
            operations: operations.to_vec(),
            executed: operations.len(),
        };
        if inner.records.insert(key.to_string(), record).is_none() {
            inner.order.push(key.to_string());
        }

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        if inner.records.remove(key).is_some() {
            inner.order.retain(|k| k != key);
        }

        Ok(())
    }

    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        Ok(inner
            .order
            .iter()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn list(&self) -> Result<Vec<TransactionRecord>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        Ok(inner
            .order
            .iter()
            .filter_map(|k| inner.records.get(k).cloned())
            .collect())
    }

    async fn clean(&self) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        inner.records.clear();
        inner.order.clear();

        Ok(())
    }
}
