//! Subprocess-backed operation runner.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use fleet_agent_core::{Action, OperationError, OperationRunner};
use tokio::process::Command;

use crate::{
    command::{CommandBuildError, HelperCommand},
    shell::get_shell_command,
};

fn build_error(e: CommandBuildError) -> OperationError {
    match e {
        CommandBuildError::NotFound(name) => OperationError::ExecutableNotFound(name),
        other => OperationError::InvalidCommand(other.to_string()),
    }
}

/// Runs actions as subprocesses.
///
/// `exec` actions go through the shell; any other action name is a
/// helper executable looked up in the helpers directory, then PATH.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    helpers_dir: Option<PathBuf>,
}

impl ShellRunner {
    /// Create a runner that searches `helpers_dir` before PATH.
    #[must_use]
    pub const fn new(helpers_dir: Option<PathBuf>) -> Self {
        Self { helpers_dir }
    }

    async fn command_for(&self, action: &Action) -> Result<Command, OperationError> {
        if action.name == Action::EXEC {
            let line = action
                .args
                .first()
                .filter(|l| !l.trim().is_empty())
                .ok_or_else(|| {
                    OperationError::InvalidCommand(format!(
                        "'{}' has no command line",
                        action.description
                    ))
                })?;
            let (shell, flag) = get_shell_command();
            let mut cmd = Command::new(shell);
            cmd.arg(flag).arg(line);
            return Ok(cmd);
        }

        let (program, args) = HelperCommand::from_action(action)
            .map_err(build_error)?
            .resolve(self.helpers_dir.as_deref())
            .await
            .map_err(build_error)?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }

    /// Helpers directory searched first.
    #[must_use]
    pub fn helpers_dir(&self) -> Option<&Path> {
        self.helpers_dir.as_deref()
    }
}

#[async_trait]
impl OperationRunner for ShellRunner {
    async fn run(&self, action: &Action) -> Result<(), OperationError> {
        let mut cmd = self.command_for(action).await?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(name = %action.name, args = ?action.args, "{}", action.description);

        // Run in its own process group so shell pipelines are reaped together.
        let child = cmd.group_spawn()?;
        let output = child.wait_with_output().await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(OperationError::Failed {
                description: action.description.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
