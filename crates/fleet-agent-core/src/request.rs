//! Requests, operations and the persisted transaction record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A declarative configuration request received from the fleet manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Request type, e.g. `add-interface`.
    pub message: String,

    /// Request parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    /// Create a new request.
    #[must_use]
    pub fn new(message: impl Into<String>, params: Value) -> Self {
        Self {
            message: message.into(),
            params,
        }
    }

    /// Get a string parameter.
    #[must_use]
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    /// Whether the request tells the agent that the local network
    /// configuration changes and the session must be reopened.
    #[must_use]
    pub fn wants_reconnect(&self) -> bool {
        self.params
            .get("reconnect")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// One side of an operation: a named action with arguments.
///
/// The name `exec` denotes a shell line in `args[0]`; any other name is
/// a helper executable invoked with `args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub description: String,
}

impl Action {
    /// Name of the shell-line action.
    pub const EXEC: &'static str = "exec";

    /// Create a helper action.
    #[must_use]
    pub fn new<I>(name: impl Into<String>, args: I, description: impl Into<String>) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
            description: description.into(),
        }
    }

    /// Create a shell-line action.
    #[must_use]
    pub fn exec(command: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: Self::EXEC.to_string(),
            args: vec![command.into()],
            description: description.into(),
        }
    }
}

/// A forward action paired with the action that undoes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub forward: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert: Option<Action>,
}

impl Operation {
    /// Operation without a revert step.
    #[must_use]
    pub const fn new(forward: Action) -> Self {
        Self {
            forward,
            revert: None,
        }
    }

    /// Attach a revert step.
    #[must_use]
    pub fn with_revert(mut self, revert: Action) -> Self {
        self.revert = Some(revert);
        self
    }
}

/// A successfully applied request and the operations it ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub key: String,
    pub request: Request,
    pub operations: Vec<Operation>,
    /// Number of forward operations that were applied.
    pub executed: usize,
}

/// Outcome of executing one request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
    pub ok: bool,
    pub message: Option<String>,
    pub payload: Map<String, Value>,
}

impl Reply {
    /// Successful reply without payload.
    #[must_use]
    pub fn success() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    /// Failed reply carrying an error description.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
            payload: Map::new(),
        }
    }

    /// Add a payload field.
    #[must_use]
    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reconnect_hint() {
        let req = Request::new("modify-interface", json!({"pci": "0000:00:03.00", "reconnect": true}));
        assert!(req.wants_reconnect());

        let req = Request::new("add-route", json!({"addr": "10.0.0.0/8"}));
        assert!(!req.wants_reconnect());

        let req = Request::new("start-router", Value::Null);
        assert!(!req.wants_reconnect());
    }

    #[test]
    fn test_request_without_params_deserializes() {
        let req: Request = serde_json::from_str(r#"{"message":"start-router"}"#).unwrap();
        assert_eq!(req.message, "start-router");
        assert!(req.params.is_null());
        assert_eq!(req.param_str("pci"), None);
    }

    #[test]
    fn test_exec_action() {
        let action = Action::exec("ip link set dev eth1 down", "shutdown eth1");
        assert_eq!(action.name, Action::EXEC);
        assert_eq!(action.args, vec!["ip link set dev eth1 down".to_string()]);
    }
}
