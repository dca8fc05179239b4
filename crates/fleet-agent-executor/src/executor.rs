//! Transactional request execution.
//!
//! A request is translated into operations which run in order. Either all
//! of them are applied and the request is stored, or the applied prefix is
//! reverted in reverse order and nothing is stored.

use std::sync::Arc;

use fleet_agent_core::{
    Operation, OperationError, OperationRunner, Reply, Request, RequestStore, StoreError,
    TransactionRecord,
};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    stats::{DeviceStats, GET_DEVICE_STATS},
    translate::{Dedup, Effect, START_ROUTER_KEY, TranslationError, TranslatorRegistry},
};

/// Query returning the stored configuration.
pub const GET_ROUTER_CONFIG: &str = "get-router-config";

/// Order in which stored requests are replayed.
const REPLAY_ORDER: [&str; 5] = [
    "start-router",
    "add-interface",
    "add-route",
    "add-tunnel",
    "add-dhcp-config",
];

/// Request execution error.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error("{description}: {source}")]
    Operation {
        description: String,
        #[source]
        source: OperationError,
    },
    #[error("Failed to persist {key}: {source}")]
    Persist {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Executes requests one at a time against a store.
pub struct RequestExecutor {
    registry: TranslatorRegistry,
    store: Arc<dyn RequestStore>,
    runner: Arc<dyn OperationRunner>,
    stats: Option<Arc<DeviceStats>>,
    gate: Mutex<()>,
}

impl RequestExecutor {
    #[must_use]
    pub fn new(
        registry: TranslatorRegistry,
        store: Arc<dyn RequestStore>,
        runner: Arc<dyn OperationRunner>,
    ) -> Self {
        Self {
            registry,
            store,
            runner,
            stats: None,
            gate: Mutex::new(()),
        }
    }

    /// Serve `get-device-stats` from `stats`.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<DeviceStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    #[must_use]
    pub const fn stats(&self) -> Option<&Arc<DeviceStats>> {
        self.stats.as_ref()
    }

    /// The store applied requests are recorded in.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    /// Execute one request. Failures are reported in the reply.
    pub async fn execute(&self, request: &Request) -> Reply {
        if request.message == GET_ROUTER_CONFIG {
            return match self.configuration(false).await {
                Ok(config) => Reply::success().with_payload("message", config),
                Err(e) => Reply::failure(e.to_string()),
            };
        }
        if request.message == GET_DEVICE_STATS {
            let updates = self.stats.as_ref().map(|s| s.drain()).unwrap_or_default();
            return match serde_json::to_value(updates) {
                Ok(updates) => Reply::success().with_payload("message", updates),
                Err(e) => Reply::failure(e.to_string()),
            };
        }

        let _guard = self.gate.lock().await;
        match self.dispatch(request).await {
            Ok(()) => Reply::success(),
            Err(e) => {
                tracing::warn!(request = %request.message, error = %e, "Request failed");
                Reply::failure(e.to_string())
            }
        }
    }

    async fn dispatch(&self, request: &Request) -> Result<(), ExecuteError> {
        let translator = self.registry.get(&request.message)?;
        let key = translator.key(request)?;

        if translator.effect() == Effect::Teardown {
            return self.teardown(&key).await;
        }

        if let Some(existing) = self.store.get(&key).await? {
            match translator.dedup() {
                Dedup::SkipIfApplied => {
                    tracing::debug!(key = %key, "Already applied");
                    return Ok(());
                }
                Dedup::ReplaceIfChanged if existing.request == *request => {
                    tracing::debug!(key = %key, "Unchanged");
                    return Ok(());
                }
                Dedup::ReplaceIfChanged => {
                    tracing::info!(key = %key, "Replacing changed configuration");
                    self.revert_record(&existing).await?;
                }
            }
        }

        let operations = translator.operations(request, self.store.as_ref()).await?;
        self.apply(&key, request, &operations).await
    }

    async fn apply(
        &self,
        key: &str,
        request: &Request,
        operations: &[Operation],
    ) -> Result<(), ExecuteError> {
        for (applied, op) in operations.iter().enumerate() {
            if let Err(source) = self.runner.run(&op.forward).await {
                tracing::error!(key, step = %op.forward.description, error = %source, "Operation failed, rolling back");
                self.rollback(&operations[..applied]).await;
                return Err(ExecuteError::Operation {
                    description: op.forward.description.clone(),
                    source,
                });
            }
        }

        if let Err(source) = self.store.put(key, request, operations).await {
            tracing::error!(key, error = %source, "Failed to persist, rolling back");
            self.rollback(operations).await;
            return Err(ExecuteError::Persist {
                key: key.to_string(),
                source,
            });
        }

        tracing::info!(key, operations = operations.len(), "Request applied");
        Ok(())
    }

    /// Run revert actions in reverse order. Failures are logged and skipped.
    async fn rollback(&self, applied: &[Operation]) {
        for revert in applied.iter().rev().filter_map(|op| op.revert.as_ref()) {
            if let Err(e) = self.runner.run(revert).await {
                tracing::error!(step = %revert.description, error = %e, "Revert failed");
            }
        }
    }

    async fn teardown(&self, key: &str) -> Result<(), ExecuteError> {
        match self.store.get(key).await? {
            Some(record) => self.revert_record(&record).await,
            None => {
                tracing::debug!(key, "Nothing to remove");
                Ok(())
            }
        }
    }

    async fn revert_record(&self, record: &TransactionRecord) -> Result<(), ExecuteError> {
        let executed = record.executed.min(record.operations.len());
        self.rollback(&record.operations[..executed]).await;
        self.store.remove(&record.key).await?;
        tracing::info!(key = %record.key, "Request reverted");
        Ok(())
    }

    /// Stored records in replay order; insertion order within each type.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn replay(&self) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut records = self.store.list().await?;
        records.sort_by_key(|r| replay_rank(&r.request.message));
        Ok(records)
    }

    /// Whether a `start-router` record is stored.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn has_router_config(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(START_ROUTER_KEY).await?.is_some())
    }

    /// Apply every stored request again, in replay order.
    ///
    /// Used after the dataplane restarted and lost its state. Each request
    /// is translated anew; its record is replaced with the operations that
    /// ran. A failing request is rolled back and stops the restore.
    ///
    /// # Errors
    /// Returns error on the first request that cannot be applied.
    pub async fn restore(&self) -> Result<usize, ExecuteError> {
        let _guard = self.gate.lock().await;
        let records = self.replay().await?;
        for record in &records {
            let translator = self.registry.get(&record.request.message)?;
            let operations = translator
                .operations(&record.request, self.store.as_ref())
                .await?;
            self.apply(&record.key, &record.request, &operations).await?;
        }
        if !records.is_empty() {
            tracing::info!(count = records.len(), "Stored configuration restored");
        }
        Ok(records.len())
    }

    /// Stored configuration as a JSON list of `{message, params}`.
    ///
    /// With `full`, each entry also carries its key and operations.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn configuration(&self, full: bool) -> Result<Value, StoreError> {
        let entries = self
            .replay()
            .await?
            .into_iter()
            .map(|record| {
                let mut entry = json!({
                    "message": record.request.message,
                    "params": record.request.params,
                });
                if full {
                    entry["key"] = json!(record.key);
                    entry["operations"] = json!(record.operations);
                }
                entry
            })
            .collect();
        Ok(Value::Array(entries))
    }
}

fn replay_rank(message: &str) -> usize {
    REPLAY_ORDER
        .iter()
        .position(|m| *m == message)
        .unwrap_or(REPLAY_ORDER.len())
}
