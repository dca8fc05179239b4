//! `add-tunnel` / `remove-tunnel`.

use async_trait::async_trait;
use fleet_agent_core::{Action, Operation, Request, RequestStore};

use super::{Effect, TranslationError, Translator, optional_token, token};

const HELPER: &str = "fleet-tunnel";

fn tunnel_key(request: &Request) -> Result<String, TranslationError> {
    Ok(format!("add-tunnel:{}", token(request, "tunnel-id")?))
}

/// Encrypted tunnel between two devices.
pub struct AddTunnel;

#[async_trait]
impl Translator for AddTunnel {
    fn key(&self, request: &Request) -> Result<String, TranslationError> {
        tunnel_key(request)
    }

    async fn operations(
        &self,
        request: &Request,
        _store: &dyn RequestStore,
    ) -> Result<Vec<Operation>, TranslationError> {
        let id = token(request, "tunnel-id")?;
        let src = token(request, "src")?;
        let dst = token(request, "dst")?;

        let mut ops = vec![
            Operation::new(Action::new(
                HELPER,
                ["add", "--id", id.as_str(), "--src", src.as_str(), "--dst", dst.as_str()],
                format!("create tunnel {id} {src} -> {dst}"),
            ))
            .with_revert(Action::new(
                HELPER,
                ["remove", "--id", id.as_str()],
                format!("delete tunnel {id}"),
            )),
        ];

        if let Some(loopback) = optional_token(request, "loopback-addr")? {
            ops.push(
                Operation::new(Action::new(
                    HELPER,
                    ["set-addr", "--id", id.as_str(), "--addr", loopback.as_str()],
                    format!("assign {loopback} to tunnel {id}"),
                ))
                .with_revert(Action::new(
                    HELPER,
                    ["clear-addr", "--id", id.as_str()],
                    format!("clear address of tunnel {id}"),
                )),
            );
        }

        Ok(ops)
    }
}

pub struct RemoveTunnel;

#[async_trait]
impl Translator for RemoveTunnel {
    fn key(&self, request: &Request) -> Result<String, TranslationError> {
        tunnel_key(request)
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
