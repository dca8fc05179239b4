//! Core traits for request storage and operation execution.

use async_trait::async_trait;
use thiserror::Error;

use crate::request::{Action, Operation, Request, TransactionRecord};

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to encode record {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Corrupt record {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable keyed record of applied requests.
///
/// Callers serialize writes; implementations only need each call to be
/// atomic on its own.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Get the record stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<TransactionRecord>, StoreError>;

    /// Store a fully applied request, replacing any record under `key`.
    ///
    /// A replaced record keeps its original insertion position.
    async fn put(
        &self,
        key: &str,
        request: &Request,
        operations: &[Operation],
    ) -> Result<(), StoreError>;

    /// Remove the record under `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Keys starting with `prefix`, in insertion order.
    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// All records, in insertion order.
    async fn list(&self) -> Result<Vec<TransactionRecord>, StoreError>;

    /// Remove every record.
    async fn clean(&self) -> Result<(), StoreError>;
}

/// Operation execution error.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("Unsupported action: {0}")]
    Unsupported(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("'{description}' failed with {status}: {stderr}")]
    Failed {
        description: String,
        status: String,
        stderr: String,
    },
}

/// Runs the actions that operations are made of.
#[async_trait]
pub trait OperationRunner: Send + Sync {
    /// Run one action to completion.
    async fn run(&self, action: &Action) -> Result<(), OperationError>;
}
