//! Host-side parts of the agent, built from the configuration.
//!
//! The supervisor asks for fresh parts on every start, so edits to the
//! configuration file take effect on the next `start`.

use std::sync::Arc;

use fleet_agent_core::{AgentContext, RequestStore};
use fleet_agent_executor::{DeviceStats, RequestExecutor, ShellRunner};

use crate::{
    dataplane::{Dataplane, ShellDataplane},
    executor_with_store,
    system::{CommandChecker, SystemChecker},
};

/// Builds the executor, dataplane control and system checker.
pub trait HostFactory: Send + Sync {
    fn executor(&self, context: &AgentContext, store: Arc<dyn RequestStore>) -> RequestExecutor;

    fn dataplane(&self, context: &AgentContext) -> Arc<dyn Dataplane>;

    fn checker(&self, context: &AgentContext) -> Arc<dyn SystemChecker>;
}

/// Parts running shell commands on this host.
///
/// Statistics outlive the executors so samples survive a restart.
#[derive(Default)]
pub struct ShellHost {
    stats: Arc<DeviceStats>,
}

impl ShellHost {
    #[must_use]
    pub const fn new(stats: Arc<DeviceStats>) -> Self {
        Self { stats }
    }
}

fn runner(context: &AgentContext) -> ShellRunner {
    ShellRunner::new(context.config.helpers_dir.clone())
}

impl HostFactory for ShellHost {
    fn executor(&self, context: &AgentContext, store: Arc<dyn RequestStore>) -> RequestExecutor {
        executor_with_store(context, store).with_stats(Arc::clone(&self.stats))
    }

    fn dataplane(&self, context: &AgentContext) -> Arc<dyn Dataplane> {
        Arc::new(ShellDataplane::new(
            context.config.dataplane.clone(),
            runner(context),
        ))
    }

    fn checker(&self, context: &AgentContext) -> Arc<dyn SystemChecker> {
        Arc::new(CommandChecker::new(
            context.config.system_checker.clone(),
            runner(context),
        ))
    }
}

#[cfg(test)]
mod tests {
    use fleet_agent_core::{AgentConfig, DataplaneConfig, Request};
    use fleet_agent_executor::GET_DEVICE_STATS;
    use fleet_agent_store::MemoryStore;
    use serde_json::Value;

    use super::*;

    fn context(dir: &std::path::Path, flag: &str) -> AgentContext {
        let flag = dir.join(flag);
        AgentContext::new(AgentConfig {
            system_checker: Some(format!("test -e {}", flag.display())),
            dataplane: DataplaneConfig {
                start_command: format!("touch {}", flag.display()),
                ..DataplaneConfig::default()
            },
            ..AgentConfig::default()
        })
    }

    #[tokio::test]
    async fn test_parts_follow_the_given_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let host = ShellHost::default();

        let first = context(dir.path(), "first");
        tokio_test::assert_err!(host.checker(&first).check().await);
        tokio_test::assert_ok!(host.dataplane(&first).start().await);
        tokio_test::assert_ok!(host.checker(&first).check().await);

        let second = context(dir.path(), "second");
        tokio_test::assert_err!(host.checker(&second).check().await);
        tokio_test::assert_ok!(host.dataplane(&second).start().await);
        assert!(dir.path().join("second").exists());
    }

    #[tokio::test]
    async fn test_executors_share_statistics() {
        let dir = tempfile::tempdir().unwrap();
        let counters = dir.path().join("net_dev");
        std::fs::write(&counters, "Inter-|\n face |\n  eth0: 1 1 0 0 0 0 0 0 1 1 0 0 0 0 0 0\n").unwrap();
        let stats = Arc::new(DeviceStats::new(&counters));
        let host = ShellHost::new(Arc::clone(&stats));
        let context = AgentContext::new(AgentConfig::default());

        let before = host.executor(&context, Arc::new(MemoryStore::new()));
        before.stats().unwrap().update().await;
        drop(before);

        let after = host.executor(&context, Arc::new(MemoryStore::new()));
        let reply = after
            .execute(&Request::new(GET_DEVICE_STATS, Value::Null))
            .await;
        assert_eq!(reply.payload["message"].as_array().map(Vec::len), Some(1));
    }
}
