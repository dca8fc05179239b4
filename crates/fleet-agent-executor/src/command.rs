//! Helper command lines built from actions.

use std::path::{Path, PathBuf};

use fleet_agent_core::Action;
use thiserror::Error;

use crate::shell::resolve_executable_path;

#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Helper name cannot be parsed: {0}")]
    InvalidName(String),
    #[error("Helper name is empty")]
    EmptyName,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// A helper invocation: program plus arguments.
///
/// The action name may carry leading arguments (`fleet-startup-conf
/// add-devices`); it is split shell-style. Action arguments are appended
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HelperCommand {
    /// # Errors
    /// Returns error if the action name is empty or cannot be split.
    pub fn from_action(action: &Action) -> Result<Self, CommandBuildError> {
        let mut words = shlex::split(&action.name)
            .ok_or_else(|| CommandBuildError::InvalidName(action.name.clone()))?;
        if words.is_empty() {
            return Err(CommandBuildError::EmptyName);
        }
        let program = words.remove(0);
        words.extend(action.args.iter().cloned());
        Ok(Self {
            program,
            args: words,
        })
    }

    /// Resolve the program against `helpers_dir`, then PATH.
    ///
    /// # Errors
    /// Returns error if the executable is not found.
    pub async fn resolve(
        self,
        helpers_dir: Option<&Path>,
    ) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let executable = resolve_executable_path(&self.program, helpers_dir)
            .await
            .ok_or(CommandBuildError::NotFound(self.program))?;
        Ok((executable, self.args))
    }
}
