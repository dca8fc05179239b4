//! `start-router` / `stop-router`.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_agent_core::{Action, DataplaneConfig, Operation, Request, RequestStore};

use super::{Effect, TranslationError, Translator};
use crate::resolver::InterfaceResolver;

/// Key of the single start-router record.
pub const START_ROUTER_KEY: &str = "start-router";

const STARTUP_CONF_HELPER: &str = "fleet-startup-conf";
const APPLY_HOST_NETWORK: &str = "netplan apply";

/// Hands the applied interfaces over to the dataplane and starts it.
pub struct StartRouter {
    resolver: Arc<dyn InterfaceResolver>,
    dataplane: DataplaneConfig,
}

impl StartRouter {
    #[must_use]
    pub fn new(resolver: Arc<dyn InterfaceResolver>, dataplane: DataplaneConfig) -> Self {
        Self { resolver, dataplane }
    }
}

#[async_trait]
impl Translator for StartRouter {
    fn key(&self, _request: &Request) -> Result<String, TranslationError> {
        Ok(START_ROUTER_KEY.to_string())
    }

    async fn operations(
        &self,
        _request: &Request,
        store: &dyn RequestStore,
    ) -> Result<Vec<Operation>, TranslationError> {
        let mut ops = Vec::new();
        let mut whitelist = Vec::new();

        // Interfaces leave the host stack before the dataplane may claim them.
        for key in store.keys_matching("add-interface").await? {
            let Some(record) = store.get(&key).await? else {
                continue;
            };
            let Some(pci) = record.request.param_str("pci") else {
                continue;
            };

            if let Some(dev) = self.resolver.host_name(pci) {
                ops.push(
                    Operation::new(Action::new(
                        "ip",
                        ["link", "set", "dev", dev.as_str(), "down"],
                        format!("shutdown dev {dev} in host"),
                    ))
                    .with_revert(Action::exec(
                        APPLY_HOST_NETWORK,
                        "apply host network configuration",
                    )),
                );
                ops.push(Operation::new(Action::new(
                    "ip",
                    ["addr", "flush", "dev", dev.as_str()],
                    format!("flush addresses of {dev}"),
                )));
            }

            // vmxnet3 devices are created at runtime; whitelisting them
            // makes the dataplane grab them with the wrong driver.
            if record.request.param_str("driver") != Some("vmxnet3") {
                whitelist.push(pci.to_string());
            }
        }

        let conf = self.dataplane.startup_conf.display().to_string();
        if !whitelist.is_empty() {
            let devices = whitelist.join(",");
            ops.push(
                Operation::new(Action::new(
                    STARTUP_CONF_HELPER,
                    ["add-devices", "--file", conf.as_str(), "--devices", devices.as_str()],
                    format!("add devices to {conf}"),
                ))
                .with_revert(Action::new(
                    STARTUP_CONF_HELPER,
                    ["remove-devices", "--file", conf.as_str(), "--devices", devices.as_str()],
                    format!("remove devices from {conf}"),
                )),
            );
        }

        ops.push(
            Operation::new(Action::new(
                STARTUP_CONF_HELPER,
                ["add-nat", "--file", conf.as_str()],
                format!("add NAT to {conf}"),
            ))
            .with_revert(Action::new(
                STARTUP_CONF_HELPER,
                ["remove-nat", "--file", conf.as_str()],
                format!("remove NAT from {conf}"),
            )),
        );
        ops.push(Operation::new(Action::exec(
            "modprobe vfio-pci && (echo Y | tee /sys/module/vfio/parameters/enable_unsafe_noiommu_mode)",
            "enable vfio-pci driver in host",
        )));
        ops.push(
            Operation::new(Action::exec(
                self.dataplane.start_command.as_str(),
                "start dataplane",
            ))
            .with_revert(Action::exec(
                self.dataplane.stop_command.as_str(),
                "stop dataplane",
            )),
        );
        ops.push(Operation::new(Action::exec(
            "vppctl enable tap-inject",
            "enable tap-inject",
        )));
        ops.push(Operation::new(Action::exec(
            "vppctl nat44 forwarding enable",
            "enable NAT forwarding",
        )));
        ops.push(Operation::new(Action::exec(
            APPLY_HOST_NETWORK,
            "apply host network configuration",
        )));

        Ok(ops)
    }
}

/// Reverts `start-router`, returning interfaces to the host.
pub struct StopRouter;

#[async_trait]
impl Translator for StopRouter {
    fn key(&self, _request: &Request) -> Result<String, TranslationError> {
        Ok(START_ROUTER_KEY.to_string())
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

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_agent_store::MemoryStore;
    use serde_json::{Value, json};

    struct FixedResolver;

    impl InterfaceResolver for FixedResolver {
        fn host_name(&self, pci: &str) -> Option<String> {
            match pci {
                "0000:00:08.00" => Some("enp0s8".to_string()),
                "0000:00:09.00" => Some("enp0s9".to_string()),
                _ => None,
            }
        }
    }

    fn start_router() -> StartRouter {
        StartRouter::new(Arc::new(FixedResolver), DataplaneConfig::default())
    }

    fn position(ops: &[Operation], description: &str) -> usize {
        ops.iter()
            .position(|op| op.forward.description == description)
            .unwrap_or_else(|| panic!("no operation '{description}'"))
    }

    #[tokio::test]
    async fn test_interfaces_leave_host_before_whitelist() {
        let store = MemoryStore::new();
        store
            .put(
                "add-interface:0000:00:08.00",
                &Request::new("add-interface", json!({"pci": "0000:00:08.00", "addr": "10.0.0.4/24"})),
                &[],
            )
            .await
            .unwrap();

        let ops = start_router()
            .operations(&Request::new("start-router", Value::Null), &store)
            .await
            .unwrap();

        let shutdown = position(&ops, "shutdown dev enp0s8 in host");
        let whitelist = position(&ops, "add devices to /etc/vpp/startup.conf");
        let start = position(&ops, "start dataplane");
        assert!(shutdown < whitelist);
        assert!(whitelist < start);
        assert!(ops[whitelist].forward.args.contains(&"0000:00:08.00".to_string()));
        assert_eq!(
            ops[start].revert.as_ref().map(|a| a.args[0].as_str()),
            Some("systemctl stop vpp")
        );
    }

    #[tokio::test]
    async fn test_vmxnet3_not_whitelisted() {
        let store = MemoryStore::new();
        store
            .put(
                "add-interface:0000:00:08.00",
                &Request::new("add-interface", json!({"pci": "0000:00:08.00", "driver": "vmxnet3"})),
                &[],
            )
            .await
            .unwrap();
        store
            .put(
                "add-interface:0000:00:09.00",
                &Request::new("add-interface", json!({"pci": "0000:00:09.00"})),
                &[],
            )
            .await
            .unwrap();

        let ops = start_router()
            .operations(&Request::new("start-router", Value::Null), &store)
            .await
            .unwrap();

        let whitelist = &ops[position(&ops, "add devices to /etc/vpp/startup.conf")];
        assert!(whitelist.forward.args.contains(&"0000:00:09.00".to_string()));
        assert!(!whitelist.forward.args.iter().any(|a| a.contains("0000:00:08.00")));
        // Both still leave the host stack.
        position(&ops, "shutdown dev enp0s8 in host");
        position(&ops, "shutdown dev enp0s9 in host");
    }

    #[tokio::test]
    async fn test_no_interfaces_no_whitelist() {
        let store = MemoryStore::new();
        let ops = start_router()
            .operations(&Request::new("start-router", Value::Null), &store)
            .await
            .unwrap();
        assert!(!ops.iter().any(|op| op.forward.description.starts_with("add devices")));
        position(&ops, "start dataplane");
    }
}
