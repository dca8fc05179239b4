//! Fleet device agent.
//!
//! Provides:
//! - `AgentSupervisor` - Start/stop/reset of the connection loop
//! - Local control surface used by the command line
//! - Dataplane and system checker seams, built per start by a `HostFactory`

pub mod control;
pub mod dataplane;
pub mod host;
pub mod supervisor;
pub mod system;

use std::sync::Arc;

use fleet_agent_core::{AgentContext, RequestStore, StoreError};
use fleet_agent_executor::{RequestExecutor, ShellRunner, SysfsResolver, TranslatorRegistry};
use fleet_agent_store::SqliteStore;

pub use control::{ControlClient, ControlError, DaemonReply, StartParams, StopParams};
pub use dataplane::{Dataplane, ShellDataplane};
pub use host::{HostFactory, ShellHost};
pub use supervisor::{AgentStatus, AgentSupervisor, LinkFactory, ManagerLinks, SupervisorError};
pub use system::{CommandChecker, SystemChecker};

/// Executor over `store` with the built-in translators and a shell runner.
#[must_use]
pub fn executor_with_store(context: &AgentContext, store: Arc<dyn RequestStore>) -> RequestExecutor {
    let registry = TranslatorRegistry::with_defaults(
        Arc::new(SysfsResolver::default()),
        context.config.dataplane.clone(),
    );
    let runner = ShellRunner::new(context.config.helpers_dir.clone());
    RequestExecutor::new(registry, store, Arc::new(runner))
}

/// The durable request store.
///
/// # Errors
/// Returns error if the store cannot be opened.
pub async fn open_store(context: &AgentContext) -> Result<Arc<dyn RequestStore>, StoreError> {
    Ok(Arc::new(SqliteStore::open(&context.store_file()).await?))
}

/// Executor over the durable request store.
///
/// # Errors
/// Returns error if the store cannot be opened.
pub async fn open_executor(context: &AgentContext) -> Result<RequestExecutor, StoreError> {
    Ok(executor_with_store(context, open_store(context).await?))
}
