//! Host precondition checks run before the agent starts.

use async_trait::async_trait;
use fleet_agent_core::{Action, OperationError, OperationRunner};
use fleet_agent_executor::ShellRunner;

#[async_trait]
pub trait SystemChecker: Send + Sync {
    /// Verify the host can run the dataplane.
    async fn check(&self) -> Result<(), OperationError>;
}

/// Runs the configured checker command; passes when none is configured.
pub struct CommandChecker {
    command: Option<String>,
    runner: ShellRunner,
}

impl CommandChecker {
    #[must_use]
    pub const fn new(command: Option<String>, runner: ShellRunner) -> Self {
        Self { command, runner }
    }
}

#[async_trait]
impl SystemChecker for CommandChecker {
    async fn check(&self) -> Result<(), OperationError> {
        let Some(command) = &self.command else {
            tracing::debug!("No system checker configured");
            return Ok(());
        };
        self.runner
            .run(&Action::exec(command.as_str(), "check system"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checker() {
        let runner = ShellRunner::default();
        tokio_test::assert_ok!(CommandChecker::new(None, runner.clone()).check().await);
        tokio_test::assert_ok!(
            CommandChecker::new(Some("true".into()), runner.clone())
                .check()
                .await
        );
        tokio_test::assert_err!(
            CommandChecker::new(Some("echo missing hugepages >&2; exit 2".into()), runner)
                .check()
                .await
        );
    }
}
