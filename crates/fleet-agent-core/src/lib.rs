//! Core abstractions for the fleet device agent.
//!
//! This crate provides the fundamental building blocks:
//! - `Request`, `Operation`, `TransactionRecord`, `Reply` - Domain types
//! - `AgentContext` - Explicit context passed to every component
//! - `RequestStore` and `OperationRunner` traits

pub mod context;
pub mod request;
pub mod traits;

pub use context::{AgentConfig, AgentContext, ConfigError, DataplaneConfig, RetryRange};
pub use request::{Action, Operation, Reply, Request, TransactionRecord};
pub use traits::{OperationError, OperationRunner, RequestStore, StoreError};
