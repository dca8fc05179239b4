//! Durable storage of applied configuration requests.
//!
//! Provides `RequestStore` implementations:
//! - `MemoryStore` - in-process, for tests and dry runs
//! - `SqliteStore` - crash-consistent single-file store (feature: sqlite)

pub mod storage;

#[cfg(feature = "memory")]
pub use storage::MemoryStore;

#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
