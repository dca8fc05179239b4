//! Device registration with the fleet manager.

use std::{
    net::{IpAddr, Ipv4Addr},
    path::Path,
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::identity::DeviceIdentity;

const REGISTER_PATH: &str = "/api/connect/register";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REPORTED_IPS: usize = 4;

/// Registration error, classified by how the engine reacts to it.
#[derive(Debug, Clone, Error)]
pub enum RegistrationError {
    #[error("Registration token not found")]
    TokenMissing,
    #[error("Registration token rejected: {0}")]
    TokenInvalid(String),
    #[error("Registration rejected by manager: {0}")]
    RejectedByManager(String),
    #[error("Failed to reach manager: {0}")]
    TransportFailure(String),
}

impl RegistrationError {
    /// Whether both errors are of the same kind, regardless of text.
    #[must_use]
    pub fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Classify the body of a non-2xx registration response.
    #[must_use]
    pub fn from_rejection(body: &str) -> Self {
        #[derive(Deserialize)]
        struct ErrorBody {
            error: String,
        }

        let reason = serde_json::from_str::<ErrorBody>(body)
            .map(|b| b.error)
            .unwrap_or_else(|_| body.trim().to_string());
        match reason.to_lowercase().as_str() {
            "token not found" | "invalid token" => Self::TokenInvalid(reason),
            _ => Self::RejectedByManager(reason),
        }
    }
}

/// Exchanges a registration token for a device identity.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Register the device. Returns the manager response body, which
    /// holds a valid [`DeviceIdentity`].
    async fn register(&self, token: &str) -> Result<String, RegistrationError>;
}

/// Host metadata sent along with the token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostInfo {
    pub machine_id: String,
    pub machine_name: String,
    pub ip_list: Vec<String>,
    pub default_route: String,
    pub default_dev: String,
    pub interfaces: Value,
}

impl HostInfo {
    /// Collect metadata of the running host.
    pub async fn collect(machine_id: &str) -> Self {
        let machine_name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ip_list = host_addresses(&machine_name).await;
        let (default_route, default_dev) = tokio::fs::read_to_string("/proc/net/route")
            .await
            .ok()
            .and_then(|table| parse_default_route(&table))
            .unwrap_or_default();
        let interfaces = tokio::task::spawn_blocking(|| list_interfaces(Path::new("/sys/class/net")))
            .await
            .unwrap_or_else(|_| Value::Array(Vec::new()));

        Self {
            machine_id: machine_id.to_string(),
            machine_name,
            ip_list,
            default_route,
            default_dev,
            interfaces,
        }
    }

    fn form(&self, token: &str, version: &str) -> Vec<(&'static str, String)> {
        vec![
            ("token", token.trim().to_string()),
            ("fwagent_version", version.to_string()),
            ("machine_id", self.machine_id.clone()),
            ("machine_name", self.machine_name.clone()),
            ("ip_list", self.ip_list.join(", ")),
            ("default_route", self.default_route.clone()),
            ("default_dev", self.default_dev.clone()),
            ("interfaces", self.interfaces.to_string()),
        ]
    }
}

async fn host_addresses(name: &str) -> Vec<String> {
    let Ok(addrs) = tokio::net::lookup_host((name, 0)).await else {
        return Vec::new();
    };
    let mut ips: Vec<String> = Vec::new();
    for ip in addrs.map(|a| a.ip()).filter(IpAddr::is_ipv4) {
        let ip = ip.to_string();
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    ips.truncate(MAX_REPORTED_IPS);
    ips
}

/// Gateway and device of the default route in a `/proc/net/route` table.
#[must_use]
pub fn parse_default_route(table: &str) -> Option<(String, String)> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (dev, dest, gateway) = (fields.first()?, fields.get(1)?, fields.get(2)?);
        if *dest != "00000000" {
            return None;
        }
        let gateway = u32::from_str_radix(gateway, 16).ok()?;
        // The kernel prints the network-order address as a native integer.
        let gateway = Ipv4Addr::from(gateway.to_ne_bytes());
        Some((gateway.to_string(), (*dev).to_string()))
    })
}

/// Network interfaces under `root` with their MAC and PCI address.
fn list_interfaces(root: &Path) -> Value {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Value::Array(Vec::new());
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    names
        .into_iter()
        .map(|name| {
            let dir = root.join(&name);
            let mac = std::fs::read_to_string(dir.join("address"))
                .map(|m| m.trim().to_string())
                .unwrap_or_default();
            let pci = std::fs::read_link(dir.join("device"))
                .ok()
                .and_then(|p| p.file_name().map(|f| f.to_string_lossy().into_owned()));
            json!({"name": name, "MAC": mac, "pciaddr": pci})
        })
        .collect()
}

/// Registrar posting a form to the manager over HTTPS.
pub struct HttpRegistrar {
    client: reqwest::Client,
    url: String,
    version: String,
    machine_id: String,
}

impl HttpRegistrar {
    /// Create a registrar for `management_url`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(
        management_url: &str,
        version: impl Into<String>,
        machine_id: impl Into<String>,
    ) -> Result<Self, RegistrationError> {
        let version = version.into();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("fleet-agent/{version}"))
            .build()
            .map_err(|e| RegistrationError::TransportFailure(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}{REGISTER_PATH}", management_url.trim_end_matches('/')),
            version,
            machine_id: machine_id.into(),
        })
    }
}

#[async_trait]
impl Registrar for HttpRegistrar {
    async fn register(&self, token: &str) -> Result<String, RegistrationError> {
        let host = HostInfo::collect(&self.machine_id).await;
        tracing::info!(
            url = %self.url,
            hostname = %host.machine_name,
            ips = %host.ip_list.join(", "),
            device_id = %host.machine_id,
            "Registering with manager"
        );

        let response = self
            .client
            .post(&self.url)
            .form(&host.form(token, &self.version))
            .send()
            .await
            .map_err(|e| RegistrationError::TransportFailure(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RegistrationError::TransportFailure(e.to_string()))?;

        if !status.is_success() {
            tracing::error!(%status, response = %body, "Registration failed");
            return Err(RegistrationError::from_rejection(&body));
        }

        DeviceIdentity::parse(&body).map_err(|e| {
            RegistrationError::RejectedByManager(format!("malformed registration response: {e}"))
        })?;
        tracing::info!("Registration successful");
        Ok(body)
    }
}
