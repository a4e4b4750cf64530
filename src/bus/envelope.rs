//! Wire envelopes exchanged with the bridge.
//!
//! Outbound commands are serialized with an internally tagged `type` field.
//! Inbound frames are parsed leniently: unknown control frames must not break
//! the connection, so every field except the tag is optional.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message headers. The bridge carries them as a flat string map.
pub type Headers = HashMap<String, String>;

/// Type tag the bridge uses for error notices.
pub const ERROR_TYPE: &str = "err";

/// A command frame sent to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundEnvelope<'a> {
    Ping,
    Register {
        address: &'a str,
        #[serde(skip_serializing_if = "is_empty")]
        headers: &'a Headers,
    },
    Unregister {
        address: &'a str,
        #[serde(skip_serializing_if = "is_empty")]
        headers: &'a Headers,
    },
    Send {
        address: &'a str,
        body: &'a Value,
        #[serde(skip_serializing_if = "is_empty")]
        headers: &'a Headers,
        #[serde(rename = "replyAddress", skip_serializing_if = "Option::is_none")]
        reply_address: Option<&'a str>,
    },
    Publish {
        address: &'a str,
        body: &'a Value,
        #[serde(skip_serializing_if = "is_empty")]
        headers: &'a Headers,
    },
}

fn is_empty(headers: &&Headers) -> bool {
    headers.is_empty()
}

impl OutboundEnvelope<'_> {
    /// Wire name of the command, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEnvelope::Ping => "ping",
            OutboundEnvelope::Register { .. } => "register",
            OutboundEnvelope::Unregister { .. } => "unregister",
            OutboundEnvelope::Send { .. } => "send",
            OutboundEnvelope::Publish { .. } => "publish",
        }
    }

    /// Serialize to the JSON text carried inside a frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A frame received from the bridge.
///
/// Deliveries carry an `address`; frames without one are control frames
/// (error notices, pongs, or anything newer bridges add).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundEnvelope {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default, deserialize_with = "deserialize_headers")]
    pub headers: Headers,
    #[serde(rename = "replyAddress", default)]
    pub reply_address: Option<String>,
    #[serde(default)]
    pub send: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// How the read loop should treat an inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A message for an address.
    Delivery {
        address: String,
        envelope: InboundEnvelope,
    },
    /// An address-less error notice from the bridge.
    ServerError(String),
    /// An address-less frame of any other type.
    Control(Option<String>),
}

impl InboundEnvelope {
    /// Parse the JSON payload of one frame.
    pub fn parse(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    /// Classify the envelope for dispatch.
    pub fn classify(mut self) -> Inbound {
        if let Some(address) = self.address.take() {
            return Inbound::Delivery {
                address,
                envelope: self,
            };
        }

        if self.kind.as_deref() == Some(ERROR_TYPE) {
            let message = self
                .message
                .unwrap_or_else(|| "unspecified bridge error".to_string());
            return Inbound::ServerError(message);
        }

        Inbound::Control(self.kind)
    }
}

/// Headers may arrive as `null` or with non-string scalar values; normalize
/// them to strings so handlers always see a flat map.
fn deserialize_headers<'de, D>(deserializer: D) -> Result<Headers, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<HashMap<String, Value>> = Option::deserialize(deserializer)?;
    let mut headers = Headers::new();
    for (key, value) in raw.unwrap_or_default() {
        let value = match value {
            Value::String(s) => s,
            Value::Null => continue,
            Value::Array(_) | Value::Object(_) => {
                return Err(serde::de::Error::custom(format!(
                    "header '{}' must be a scalar value",
                    key
                )))
            }
            other => other.to_string(),
        };
        headers.insert(key, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn to_value(env: &OutboundEnvelope<'_>) -> Value {
        serde_json::from_str(&env.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_ping_serialization() {
        assert_eq!(to_value(&OutboundEnvelope::Ping), json!({"type": "ping"}));
    }

    #[test]
    fn test_register_omits_empty_headers() {
        let headers = Headers::new();
        let env = OutboundEnvelope::Register {
            address: "test",
            headers: &headers,
        };
        assert_eq!(to_value(&env), json!({"type": "register", "address": "test"}));
        assert_eq!(env.kind(), "register");
    }

    #[test]
    fn test_send_with_reply_address_and_headers() {
        let headers = Headers::from([("ham".to_string(), "biscuit".to_string())]);
        let body = json!({"foo": "bar"});
        let env = OutboundEnvelope::Send {
            address: "test.echo",
            body: &body,
            headers: &headers,
            reply_address: Some("abc-123"),
        };
        assert_eq!(
            to_value(&env),
            json!({
                "type": "send",
                "address": "test.echo",
                "body": {"foo": "bar"},
                "headers": {"ham": "biscuit"},
                "replyAddress": "abc-123"
            })
        );
    }

    #[test]
    fn test_publish_serialization() {
        let headers = Headers::new();
        let body = json!({"n": 1});
        let env = OutboundEnvelope::Publish {
            address: "test.echo",
            body: &body,
            headers: &headers,
        };
        assert_eq!(
            to_value(&env),
            json!({"type": "publish", "address": "test.echo", "body": {"n": 1}})
        );
    }

    #[test]
    fn test_parse_delivery() {
        let env = InboundEnvelope::parse(
            r#"{"type":"message","address":"test.time","body":{"now":123},"headers":{"a":"b"},"replyAddress":"r1","send":true}"#,
        )
        .unwrap();

        assert_eq!(env.address.as_deref(), Some("test.time"));
        assert_eq!(env.body, json!({"now": 123}));
        assert_eq!(env.headers.get("a").map(String::as_str), Some("b"));
        assert_eq!(env.reply_address.as_deref(), Some("r1"));
        assert!(env.send);
        match env.classify() {
            Inbound::Delivery { address, envelope } => {
                assert_eq!(address, "test.time");
                assert!(envelope.address.is_none());
            }
            other => panic!("Expected delivery, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_minimal_delivery_defaults() {
        let env = InboundEnvelope::parse(r#"{"address":"a"}"#).unwrap();
        assert_eq!(env.body, Value::Null);
        assert!(env.headers.is_empty());
        assert!(!env.send);
        assert!(env.reply_address.is_none());
    }

    #[test]
    fn test_headers_are_normalized() {
        let env = InboundEnvelope::parse(
            r#"{"address":"a","headers":{"n":5,"flag":true,"gone":null,"s":"x"}}"#,
        )
        .unwrap();
        assert_eq!(env.headers.get("n").map(String::as_str), Some("5"));
        assert_eq!(env.headers.get("flag").map(String::as_str), Some("true"));
        assert_eq!(env.headers.get("s").map(String::as_str), Some("x"));
        assert!(!env.headers.contains_key("gone"));

        let null_headers = InboundEnvelope::parse(r#"{"address":"a","headers":null}"#).unwrap();
        assert!(null_headers.headers.is_empty());
    }

    #[test]
    fn test_nested_header_value_is_rejected() {
        assert!(InboundEnvelope::parse(r#"{"address":"a","headers":{"x":{"y":1}}}"#).is_err());
    }

    #[test]
    fn test_classify_error_notice() {
        let env = InboundEnvelope::parse(r#"{"type":"err","message":"access_denied"}"#).unwrap();
        assert_eq!(env.classify(), Inbound::ServerError("access_denied".to_string()));
    }

    #[test]
    fn test_classify_unknown_control_frame() {
        let env = InboundEnvelope::parse(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(env.classify(), Inbound::Control(Some("pong".to_string())));
    }

    #[test]
    fn test_parse_rejects_truncated_json() {
        assert!(InboundEnvelope::parse(r#"{"address":"a","body":"#).is_err());
    }
}
