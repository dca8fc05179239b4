//! `add-interface` / `remove-interface`.

use async_trait::async_trait;
use fleet_agent_core::{Action, Operation, Request, RequestStore};

use super::{Effect, TranslationError, Translator, optional_token, token};

const HELPER: &str = "fleet-iface";

fn interface_key(request: &Request) -> Result<String, TranslationError> {
    Ok(format!("add-interface:{}", token(request, "pci")?))
}

/// Assigns a device to the dataplane with its address.
pub struct AddInterface;

#[async_trait]
impl Translator for AddInterface {
    fn key(&self, request: &Request) -> Result<String, TranslationError> {
        interface_key(request)
    }

    async fn operations(
        &self,
        request: &Request,
        _store: &dyn RequestStore,
    ) -> Result<Vec<Operation>, TranslationError> {
        let pci = token(request, "pci")?;
        let addr = token(request, "addr")?;

        let mut add = vec!["add".to_string(), "--pci".into(), pci.clone(), "--addr".into(), addr.clone()];
        if let Some(gateway) = optional_token(request, "gateway")? {
            add.extend(["--gateway".to_string(), gateway]);
        }

        Ok(vec![
            Operation::new(Action::new(HELPER, add, format!("add interface {pci} with {addr}")))
                .with_revert(Action::new(
                    HELPER,
                    ["remove", "--pci", pci.as_str()],
                    format!("remove interface {pci}"),
                )),
        ])
    }
}

/// Reverts a previously added interface.
pub struct RemoveInterface;

#[async_trait]
impl Translator for RemoveInterface {
    fn key(&self, request: &Request) -> Result<String, TranslationError> {
        interface_key(request)
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
