//! Request translation and transactional execution.
//!
//! Provides:
//! - Translators turning manager requests into revertible operations
//! - The single-flight executor with rollback
//! - A subprocess runner with helper lookup
//! - Interface traffic statistics

pub mod command;
pub mod executor;
pub mod resolver;
pub mod runner;
pub mod shell;
pub mod stats;
pub mod translate;

pub use command::HelperCommand;
pub use executor::{ExecuteError, GET_ROUTER_CONFIG, RequestExecutor};
pub use resolver::{InterfaceResolver, SysfsResolver};
pub use runner::ShellRunner;
pub use stats::{DeviceStats, GET_DEVICE_STATS, StatsUpdate};
pub use translate::{Dedup, Effect, TranslationError, Translator, TranslatorRegistry};
