//! Control of the local dataplane process.

use async_trait::async_trait;
use fleet_agent_core::{Action, DataplaneConfig, OperationError, OperationRunner};
use fleet_agent_executor::ShellRunner;

/// Starts and stops the packet dataplane.
#[async_trait]
pub trait Dataplane: Send + Sync {
    async fn start(&self) -> Result<(), OperationError>;

    async fn stop(&self) -> Result<(), OperationError>;

    async fn is_running(&self) -> bool;
}

/// Dataplane controlled through the configured shell commands.
pub struct ShellDataplane {
    config: DataplaneConfig,
    runner: ShellRunner,
}

impl ShellDataplane {
    #[must_use]
    pub const fn new(config: DataplaneConfig, runner: ShellRunner) -> Self {
        Self { config, runner }
    }
}

#[async_trait]
impl Dataplane for ShellDataplane {
    async fn start(&self) -> Result<(), OperationError> {
        self.runner
            .run(&Action::exec(self.config.start_command.as_str(), "start dataplane"))
            .await
    }

    async fn stop(&self) -> Result<(), OperationError> {
        self.runner
            .run(&Action::exec(self.config.stop_command.as_str(), "stop dataplane"))
            .await
    }

    async fn is_running(&self) -> bool {
        self.runner
            .run(&Action::exec(
                self.config.status_command.as_str(),
                "check dataplane",
            ))
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataplane(dir: &std::path::Path) -> ShellDataplane {
        let path = dir.join("running");
        let flag = path.display();
        ShellDataplane::new(
            DataplaneConfig {
                start_command: format!("touch {flag}"),
                stop_command: format!("rm -f {flag}"),
                status_command: format!("test -e {flag}"),
                startup_conf: dir.join("startup.conf"),
            },
            ShellRunner::default(),
        )
    }

    #[tokio::test]
    async fn test_start_stop_status() {
        let dir = tempfile::tempdir().unwrap();
        let dataplane = dataplane(dir.path());

        assert!(!dataplane.is_running().await);
        tokio_test::assert_ok!(dataplane.start().await);
        assert!(dataplane.is_running().await);
        tokio_test::assert_ok!(dataplane.stop().await);
        assert!(!dataplane.is_running().await);
    }

    #[tokio::test]
    async fn test_start_failure_reported() {
        let dataplane = ShellDataplane::new(
            DataplaneConfig {
                start_command: "exit 1".into(),
                ..DataplaneConfig::default()
            },
            ShellRunner::default(),
        );
        assert!(matches!(
            dataplane.start().await,
            Err(OperationError::Failed { .. })
        ));
    }
}
