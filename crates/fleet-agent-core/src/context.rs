//! Agent configuration and the context object handed to every component.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default location of the agent configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/fleet-agent/agent.toml";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid configuration in {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Inclusive range of seconds a randomized retry interval is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRange {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl RetryRange {
    #[must_use]
    pub const fn new(min_secs: u64, max_secs: u64) -> Self {
        Self { min_secs, max_secs }
    }
}

/// Commands used to control the local dataplane process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneConfig {
    pub start_command: String,
    pub stop_command: String,
    /// Exits with status 0 while the dataplane runs.
    pub status_command: String,
    /// Startup configuration file the whitelist helpers edit.
    pub startup_conf: PathBuf,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            start_command: "systemctl start vpp".to_string(),
            stop_command: "systemctl stop vpp".to_string(),
            status_command: "pgrep -x vpp_main || pgrep -x vpp".to_string(),
            startup_conf: PathBuf::from("/etc/vpp/startup.conf"),
        }
    }
}

/// Agent configuration, loaded from a TOML file.
///
/// Every field has a default so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the fleet manager used for registration.
    pub management_url: String,
    /// Scheme of the persistent session (`wss` or `ws`).
    pub transport: String,
    /// Device identifier; read from `/etc/machine-id` when unset.
    pub device_id: Option<String>,
    /// Directory holding the identity file, request store and failure marker.
    pub state_dir: PathBuf,
    /// Operator-provided registration token.
    pub token_file: PathBuf,
    /// Directory searched first for helper executables.
    pub helpers_dir: Option<PathBuf>,
    /// Command verifying system preconditions before start.
    pub system_checker: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub token_poll_interval_secs: u64,
    pub retry_interval: RetryRange,
    pub retry_interval_long: RetryRange,
    /// Handshake status the manager uses for devices not yet approved.
    pub not_approved_status: u16,
    /// Local port of the control surface.
    pub control_port: u16,
    pub dataplane: DataplaneConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            management_url: "https://manage.flexiwan.com:443".to_string(),
            transport: "wss".to_string(),
            device_id: None,
            state_dir: PathBuf::from("/var/lib/fleet-agent"),
            token_file: PathBuf::from("/etc/fleet-agent/token.txt"),
            helpers_dir: None,
            system_checker: None,
            heartbeat_interval_secs: 30,
            token_poll_interval_secs: 10,
            retry_interval: RetryRange::new(20, 80),
            retry_interval_long: RetryRange::new(300, 600),
            not_approved_status: 403,
            control_port: 9090,
            dataplane: DataplaneConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from `path`, falling back to defaults if the
    /// file does not exist.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed, or
    /// holds invalid values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No configuration file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(|reason| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_secs == 0 {
            return Err("heartbeat_interval_secs must be positive".into());
        }
        if self.token_poll_interval_secs == 0 {
            return Err("token_poll_interval_secs must be positive".into());
        }
        Ok(())
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub const fn token_poll_interval(&self) -> Duration {
        Duration::from_secs(self.token_poll_interval_secs)
    }
}

/// Context shared by all agent components.
///
/// Created once at process start and reloaded explicitly by the supervisor.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// File the configuration was loaded from.
    pub config_path: Option<PathBuf>,
    pub config: AgentConfig,
    /// Agent version reported to the manager.
    pub version: String,
}

impl AgentContext {
    /// Create a context from an already built configuration.
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config_path: None,
            config,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Load the context from a configuration file.
    ///
    /// # Errors
    /// Returns error if the configuration cannot be loaded.
    pub fn load(config_path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let config_path = config_path.into();
        let config = AgentConfig::load(&config_path)?;
        Ok(Self {
            config_path: Some(config_path),
            ..Self::new(config)
        })
    }

    /// Re-read the configuration file, if there is one.
    ///
    /// # Errors
    /// Returns error if the configuration cannot be loaded.
    pub fn reload(&self) -> Result<Self, ConfigError> {
        match &self.config_path {
            Some(path) => Ok(Self {
                config: AgentConfig::load(path)?,
                ..self.clone()
            }),
            None => Ok(self.clone()),
        }
    }

    /// Device identity written after registration.
    #[must_use]
    pub fn identity_file(&self) -> PathBuf {
        self.config.state_dir.join("device_token.json")
    }

    /// SQLite database of applied requests.
    #[must_use]
    pub fn store_file(&self) -> PathBuf {
        self.config.state_dir.join("requests.sqlite")
    }

    /// Marker read by the upgrade process when the session cannot be opened.
    #[must_use]
    pub fn failure_marker_file(&self) -> PathBuf {
        self.config.state_dir.join("connection_failure")
    }

    #[must_use]
    pub fn user_agent(&self) -> String {
        format!("fleet-agent/{}", self.version)
    }
}
