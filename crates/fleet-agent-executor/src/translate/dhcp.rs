//! `add-dhcp-config` / `remove-dhcp-config`.

use async_trait::async_trait;
use fleet_agent_core::{Action, Operation, Request, RequestStore};

use super::{Dedup, Effect, TranslationError, Translator, token};

const HELPER: &str = "fleet-dhcpd";
const RESTART_DHCP_SERVER: &str = "systemctl restart isc-dhcp-server";

fn dhcp_key(request: &Request) -> Result<String, TranslationError> {
    Ok(format!("add-dhcp-config:{}", token(request, "interface")?))
}

/// DHCP server configuration for one LAN interface.
///
/// A changed configuration for the same interface replaces the stored one.
pub struct AddDhcpConfig;

#[async_trait]
impl Translator for AddDhcpConfig {
    fn key(&self, request: &Request) -> Result<String, TranslationError> {
        dhcp_key(request)
    }

    fn dedup(&self) -> Dedup {
        Dedup::ReplaceIfChanged
    }

    async fn operations(
        &self,
        request: &Request,
        _store: &dyn RequestStore,
    ) -> Result<Vec<Operation>, TranslationError> {
        let interface = token(request, "interface")?;
        let config = request.params.to_string();

        Ok(vec![
            Operation::new(Action::new(
                HELPER,
                ["add", "--interface", interface.as_str(), "--config", config.as_str()],
                "modify dhcpd config file",
            ))
            .with_revert(Action::new(
                HELPER,
                ["remove", "--interface", interface.as_str()],
                "clean dhcpd config file",
            )),
            Operation::new(Action::exec(
                "vppctl ip route add 255.255.255.255/32 via punt",
                "punt ip broadcast",
            ))
            .with_revert(Action::exec(
                "vppctl ip route add 255.255.255.255/32 via drop",
                "drop ip broadcast",
            )),
            Operation::new(Action::exec(RESTART_DHCP_SERVER, "restart dhcp service"))
                .with_revert(Action::exec(RESTART_DHCP_SERVER, "restart dhcp service")),
        ])
    }
}

pub struct RemoveDhcpConfig;

#[async_trait]
impl Translator for RemoveDhcpConfig {
    fn key(&self, request: &Request) -> Result<String, TranslationError> {
        dhcp_key(request)
    }

    fn effect(&self) -> Effect {
        Effect::Teardown
    }

    async fn operations(
        &self,
        _request: &Request,
        _store: &dyn RequestStore,
    ) -> Result<Vec<Operation>, TranslationError> {
        Ok(Vec::new())
    }
}
