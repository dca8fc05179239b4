//! Wire frames exchanged with the fleet manager.
//!
//! Requests arrive as `{seq, msg: {message, params?, entity?}}` and each
//! is answered with `{seq, msg: {message, entity?, ok: 0|1, ...payload}}`.

use fleet_agent_core::{Reply, Request};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request frame from the manager.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    /// Sequence number echoed in the reply, opaque to the agent.
    pub seq: Value,
    pub msg: InboundMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub message: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub entity: Option<String>,
}

impl InboundMessage {
    #[must_use]
    pub fn to_request(&self) -> Request {
        Request::new(self.message.clone(), self.params.clone())
    }
}

/// Reply frame to the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub seq: Value,
    pub msg: Map<String, Value>,
}

impl OutboundFrame {
    /// Build the reply to a request.
    ///
    /// Missing fields default to `entity: "<entity>Reply"` and
    /// `message: "success"`; a failure carries its error text as message.
    #[must_use]
    pub fn reply(seq: Value, entity: Option<&str>, reply: Reply) -> Self {
        let mut msg = reply.payload;
        msg.insert("ok".into(), Value::from(u8::from(reply.ok)));

        if let Some(text) = reply.message {
            msg.insert("message".into(), Value::String(text));
        }
        if let Some(entity) = entity {
            msg.entry("entity")
                .or_insert_with(|| Value::String(format!("{entity}Reply")));
        }
        msg.entry("message")
            .or_insert_with(|| Value::String("success".into()));

        Self { seq, msg }
    }

    /// Serialized frame text.
    #[must_use]
    pub fn to_text(&self) -> String {
        // A map of JSON values always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request_frame() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"seq":17,"msg":{"message":"add-route","params":{"addr":"8.8.8.8/32","via":"10.0.0.1"},"entity":"agent"}}"#,
        )
        .unwrap();
        assert_eq!(frame.seq, json!(17));
        assert_eq!(frame.msg.entity.as_deref(), Some("agent"));

        let request = frame.msg.to_request();
        assert_eq!(request.message, "add-route");
        assert_eq!(request.param_str("via"), Some("10.0.0.1"));
    }

    #[test]
    fn test_params_and_entity_optional() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"seq":"a1","msg":{"message":"get-router-config"}}"#).unwrap();
        assert!(frame.msg.params.is_null());
        assert!(frame.msg.entity.is_none());
    }

    #[test]
    fn test_reply_defaults() {
        let frame = OutboundFrame::reply(json!(3), Some("agent"), Reply::success());
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"seq": 3, "msg": {"ok": 1, "entity": "agentReply", "message": "success"}})
        );

        let frame = OutboundFrame::reply(json!(4), None, Reply::failure("fwd3 failed"));
        assert_eq!(frame.msg["ok"], json!(0));
        assert_eq!(frame.msg["message"], json!("fwd3 failed"));
        assert!(!frame.msg.contains_key("entity"));
    }

    #[test]
    fn test_payload_message_kept() {
        let reply = Reply::success().with_payload("message", json!([{"message": "start-router"}]));
        let frame = OutboundFrame::reply(json!(5), Some("agent"), reply);
        assert_eq!(frame.msg["message"], json!([{"message": "start-router"}]));
    }
}
