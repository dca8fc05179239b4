//! Registration token, device identity and the connection failure marker.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// File holding the host machine id.
pub const MACHINE_ID_FILE: &str = "/etc/machine-id";

/// Identity error.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid device identity in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Identity returned by registration.
///
/// The file keeps the manager response verbatim; only these fields are
/// read back.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceIdentity {
    /// Host (and port) of the session endpoint.
    pub server: String,
    #[serde(rename = "deviceToken")]
    pub device_token: String,
}

impl DeviceIdentity {
    /// Parse a registration response body.
    ///
    /// # Errors
    /// Returns error if the body lacks `server` or `deviceToken`.
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Session URL for this device.
    #[must_use]
    pub fn session_url(&self, transport: &str, device_id: &str) -> String {
        format!(
            "{transport}://{}/{device_id}?token={}",
            self.server, self.device_token
        )
    }
}

/// Load the persisted identity. A missing file means not registered.
///
/// # Errors
/// Returns error if the file exists but cannot be read or parsed.
pub async fn load_identity(path: &Path) -> Result<Option<DeviceIdentity>, IdentityError> {
    let body = match tokio::fs::read_to_string(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(IdentityError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    DeviceIdentity::parse(&body)
        .map(Some)
        .map_err(|source| IdentityError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Persist a registration response body as the device identity.
///
/// # Errors
/// Returns error if the file cannot be written.
pub async fn save_identity(path: &Path, body: &str) -> Result<(), IdentityError> {
    let io_err = |source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    tokio::fs::write(path, body).await.map_err(io_err)
}

/// First line of the token file, if there is a non-empty one.
pub async fn read_token(path: &Path) -> Option<String> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    let token = text.lines().next()?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Device id: the configured one, else the host machine id.
pub async fn resolve_device_id(configured: Option<&str>, machine_id_file: &Path) -> Option<String> {
    if let Some(id) = configured.filter(|id| !id.trim().is_empty()) {
        return Some(id.trim().to_string());
    }
    read_token(machine_id_file).await
}

/// Record why the session could not be opened. Returns whether the marker
/// was written.
pub async fn mark_failure(path: &Path, error: &str) -> bool {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::warn!(path = %parent.display(), error = %e, "Failed to create connection failure marker directory");
            return false;
        }
    }
    if let Err(e) = tokio::fs::write(path, error).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to write connection failure marker");
        return false;
    }
    true
}

pub async fn clear_failure(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Connection failure marker removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove connection failure marker");
        }
    }
}
