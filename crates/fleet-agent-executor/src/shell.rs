//! Shell and executable resolution for operation actions.

use std::path::{Path, PathBuf};

/// Shells tried, in order, for `exec` actions.
const SHELLS: [&str; 2] = ["/bin/bash", "/bin/sh"];

/// Returns the shell program and its command flag.
///
/// Prefers bash for `&&`/`$(...)` heavy command lines, falling back to sh.
#[must_use]
pub fn get_shell_command() -> (PathBuf, &'static str) {
    let shell = SHELLS
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
        .unwrap_or_else(|| Path::new("/bin/sh"));
    (shell.to_path_buf(), "-c")
}

/// Resolve an executable by name.
///
/// The search order is:
/// 1. Explicit paths (absolute or containing a separator).
/// 2. The helpers directory, if configured.
/// 3. The current process PATH via `which`.
pub async fn resolve_executable_path(executable: &str, helpers_dir: Option<&Path>) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    if let Some(dir) = helpers_dir {
        let candidate = dir.join(executable);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    which_async(executable).await
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}
