//! `add-route` / `remove-route`.

use async_trait::async_trait;
use fleet_agent_core::{Action, Operation, Request, RequestStore};

use super::{Effect, TranslationError, Translator, optional_token, token};

const IP: &str = "ip";

fn route_key(request: &Request) -> Result<String, TranslationError> {
    Ok(format!(
        "add-route:{}:{}",
        token(request, "addr")?,
        token(request, "via")?
    ))
}

/// Static route in the host routing table.
pub struct AddRoute;

#[async_trait]
impl Translator for AddRoute {
    fn key(&self, request: &Request) -> Result<String, TranslationError> {
        route_key(request)
    }

    async fn operations(
        &self,
        request: &Request,
        _store: &dyn RequestStore,
    ) -> Result<Vec<Operation>, TranslationError> {
        let addr = token(request, "addr")?;
        let via = token(request, "via")?;
        let mut route = vec![addr.clone(), "via".to_string(), via.clone()];
        if let Some(dev) = optional_token(request, "dev")? {
            route.extend(["dev".to_string(), dev]);
        }
        let add = ["route", "add"].iter().map(ToString::to_string).chain(route.iter().cloned());
        let del = ["route", "del"].iter().map(ToString::to_string).chain(route.iter().cloned());

        Ok(vec![
            Operation::new(Action::new(IP, add, format!("add route {addr} via {via}")))
                .with_revert(Action::new(IP, del, format!("remove route {addr} via {via}"))),
        ])
    }
}

pub struct RemoveRoute;

#[async_trait]
impl Translator for RemoveRoute {
    fn key(&self, request: &Request) -> Result<String, TranslationError> {
        route_key(request)
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
    use serde_json::json;

    #[tokio::test]
    async fn test_route_is_argv() {
        let store = MemoryStore::new();
        let request = Request::new(
            "add-route",
            json!({"addr": "8.8.8.8/32", "via": "10.0.0.1", "dev": "eth1"}),
        );
        let ops = AddRoute.operations(&request, &store).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].forward.name, "ip");
        assert_eq!(
            ops[0].forward.args,
            ["route", "add", "8.8.8.8/32", "via", "10.0.0.1", "dev", "eth1"]
        );
        let revert = ops[0].revert.as_ref().unwrap();
        assert_eq!(revert.args[..2], ["route", "del"]);
    }

    #[tokio::test]
    async fn test_shell_metacharacters_rejected() {
        let store = MemoryStore::new();
        let request = Request::new(
            "add-route",
            json!({"addr": "8.8.8.8/32; touch /tmp/routed #", "via": "10.0.0.1"}),
        );
        assert!(matches!(
            AddRoute.operations(&request, &store).await,
            Err(TranslationError::InvalidParam { param: "addr", .. })
        ));
    }
}
