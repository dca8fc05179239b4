//! Translation of requests into ordered, revertible operations.

mod dhcp;
mod interface;
mod route;
mod router;
mod tunnel;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use fleet_agent_core::{DataplaneConfig, Operation, Request, RequestStore, StoreError};
use serde_json::Value;
use thiserror::Error;

pub use dhcp::{AddDhcpConfig, RemoveDhcpConfig};
pub use interface::{AddInterface, RemoveInterface};
pub use route::{AddRoute, RemoveRoute};
pub use router::{START_ROUTER_KEY, StartRouter, StopRouter};
pub use tunnel::{AddTunnel, RemoveTunnel};

use crate::resolver::InterfaceResolver;

/// Translation error.
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("Unknown request type: {0}")]
    UnknownRequestType(String),
    #[error("{request}: missing parameter '{param}'")]
    MissingParam {
        request: String,
        param: &'static str,
    },
    #[error("{request}: invalid value {value:?} for '{param}'")]
    InvalidParam {
        request: String,
        param: &'static str,
        value: String,
    },
    #[error("Failed to read applied configuration: {0}")]
    Store(#[from] StoreError),
}

/// What executing a translated request does to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Run forward operations and store the record.
    Apply,
    /// Revert the stored record under the key and remove it.
    Teardown,
}

/// How a request whose key is already stored is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dedup {
    /// Treat as already applied.
    SkipIfApplied,
    /// Skip if identical, otherwise revert the stored record and apply anew.
    ReplaceIfChanged,
}

/// Converts one request type into operations.
///
/// Translators only describe operations, never run them.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Stable key identifying the configured resource.
    fn key(&self, request: &Request) -> Result<String, TranslationError>;

    fn effect(&self) -> Effect {
        Effect::Apply
    }

    fn dedup(&self) -> Dedup {
        Dedup::SkipIfApplied
    }

    /// Ordered operations for an `Apply` request.
    ///
    /// May read already applied requests from `store`.
    async fn operations(
        &self,
        request: &Request,
        store: &dyn RequestStore,
    ) -> Result<Vec<Operation>, TranslationError>;
}

/// Registry mapping request types to translators.
#[derive(Default)]
pub struct TranslatorRegistry {
    translators: HashMap<String, Arc<dyn Translator>>,
}

impl TranslatorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in device translator.
    #[must_use]
    pub fn with_defaults(resolver: Arc<dyn InterfaceResolver>, dataplane: DataplaneConfig) -> Self {
        let mut registry = Self::new();
        registry.register("add-interface", AddInterface);
        registry.register("remove-interface", RemoveInterface);
        registry.register("add-route", AddRoute);
        registry.register("remove-route", RemoveRoute);
        registry.register("add-tunnel", AddTunnel);
        registry.register("remove-tunnel", RemoveTunnel);
        registry.register("add-dhcp-config", AddDhcpConfig);
        registry.register("remove-dhcp-config", RemoveDhcpConfig);
        registry.register("start-router", StartRouter::new(resolver, dataplane));
        registry.register("stop-router", StopRouter);
        registry
    }

    /// Register a translator, replacing any previous one for the type.
    pub fn register(&mut self, request_type: impl Into<String>, translator: impl Translator + 'static) {
        self.translators
            .insert(request_type.into(), Arc::new(translator));
    }

    /// Translator for a request type.
    ///
    /// # Errors
    /// Returns `UnknownRequestType` if none is registered.
    pub fn get(&self, request_type: &str) -> Result<Arc<dyn Translator>, TranslationError> {
        self.translators
            .get(request_type)
            .cloned()
            .ok_or_else(|| TranslationError::UnknownRequestType(request_type.to_string()))
    }

    /// Key and operations for a request.
    ///
    /// # Errors
    /// Returns error if the type is unknown or the request is malformed.
    pub async fn translate(
        &self,
        request: &Request,
        store: &dyn RequestStore,
    ) -> Result<(String, Vec<Operation>), TranslationError> {
        let translator = self.get(&request.message)?;
        let key = translator.key(request)?;
        let operations = translator.operations(request, store).await?;
        Ok((key, operations))
    }
}

/// Required parameter rendered as a string; numbers are accepted too.
pub(crate) fn required(request: &Request, param: &'static str) -> Result<String, TranslationError> {
    match request.params.get(param) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(TranslationError::MissingParam {
            request: request.message.clone(),
            param,
        }),
    }
}

/// Required parameter that must be a single address, prefix or name.
///
/// Values reach command lines as separate arguments; anything outside
/// `[A-Za-z0-9.:/_%@-]`, or starting with `-`, is rejected.
pub(crate) fn token(request: &Request, param: &'static str) -> Result<String, TranslationError> {
    let value = required(request, param)?;
    check_token(request, param, value)
}

/// Optional variant of [`token`].
pub(crate) fn optional_token(
    request: &Request,
    param: &'static str,
) -> Result<Option<String>, TranslationError> {
    request
        .param_str(param)
        .map(|value| check_token(request, param, value.to_string()))
        .transpose()
}

fn check_token(
    request: &Request,
    param: &'static str,
    value: String,
) -> Result<String, TranslationError> {
    let valid = !value.starts_with('-')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '_' | '%' | '@' | '-'));
    if valid {
        Ok(value)
    } else {
        Err(TranslationError::InvalidParam {
            request: request.message.clone(),
            param,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_agent_store::MemoryStore;
    use serde_json::json;

    struct NoResolver;

    impl InterfaceResolver for NoResolver {
        fn host_name(&self, _pci: &str) -> Option<String> {
            None
        }
    }

    fn registry() -> TranslatorRegistry {
        TranslatorRegistry::with_defaults(Arc::new(NoResolver), DataplaneConfig::default())
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let store = MemoryStore::new();
        let err = registry()
            .translate(&Request::new("reboot-universe", Value::Null), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, TranslationError::UnknownRequestType(t) if t == "reboot-universe"));
    }

    #[test]
    fn test_keys_are_stable() {
        let registry = registry();
        let add = registry.get("add-interface").unwrap();
        let first = add
            .key(&Request::new("add-interface", json!({"pci": "0000:00:08.00", "addr": "10.0.0.4/24"})))
            .unwrap();
        let second = add
            .key(&Request::new("add-interface", json!({"addr": "10.0.0.4/24", "pci": "0000:00:08.00"})))
            .unwrap();
        assert_eq!(first, "add-interface:0000:00:08.00");
        assert_eq!(first, second);

        let remove = registry.get("remove-interface").unwrap();
        assert_eq!(
            remove
                .key(&Request::new("remove-interface", json!({"pci": "0000:00:08.00"})))
                .unwrap(),
            first
        );
        assert_eq!(remove.effect(), Effect::Teardown);
    }

    #[test]
    fn test_missing_param() {
        let add = registry().get("add-route").unwrap();
        let err = add
            .key(&Request::new("add-route", json!({"addr": "8.8.8.8/32"})))
            .unwrap_err();
        assert!(matches!(err, TranslationError::MissingParam { param: "via", .. }));
    }

    #[test]
    fn test_token_rejects_shell_and_options() {
        let request = Request::new(
            "add-route",
            json!({"addr": "8.8.8.8/32; touch /tmp/x #", "via": "-batch", "dev": "eth0"}),
        );
        assert!(matches!(
            token(&request, "addr"),
            Err(TranslationError::InvalidParam { param: "addr", .. })
        ));
        assert!(matches!(
            token(&request, "via"),
            Err(TranslationError::InvalidParam { param: "via", .. })
        ));
        assert_eq!(optional_token(&request, "dev").unwrap().as_deref(), Some("eth0"));
        assert_eq!(optional_token(&request, "metric").unwrap(), None);
        let ok = Request::new("add-route", json!({"addr": "fe80::1%eth0"}));
        assert_eq!(token(&ok, "addr").unwrap(), "fe80::1%eth0");
    }

    #[test]
    fn test_numeric_params() {
        let add = registry().get("add-tunnel").unwrap();
        let key = add
            .key(&Request::new("add-tunnel", json!({"tunnel-id": 7, "src": "1.1.1.1", "dst": "2.2.2.2"})))
            .unwrap();
        assert_eq!(key, "add-tunnel:7");
    }
}
