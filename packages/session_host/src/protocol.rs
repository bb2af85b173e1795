//! Session Protocol Types
//!
//! Messages exchanged between a session and its client. Encoding is the
//! transport's concern; the hub uses JSON text frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorResponse;

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session established and configured
    Connected {
        session_id: String,
        /// Root components registered during configuration
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        components: Vec<RootComponent>,
    },
    /// Ask the client to run `identifier` and answer with an `invocation_result`
    Invoke {
        call_id: u64,
        identifier: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Session could not be established or failed; the connection closes next
    Error(ErrorResponse),
}

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Answer to an `invoke`; exactly one of `result`/`error` is meaningful
    InvocationResult {
        call_id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// UI event raised by the client
    Event {
        name: String,
        #[serde(default)]
        payload: Value,
    },
    /// The client's location changed (link click, history navigation)
    LocationChanged { uri: String },
}

/// A component attached to a client DOM selector when the session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootComponent {
    pub component: String,
    pub selector: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invoke_wire_shape() {
        let msg = ServerMessage::Invoke {
            call_id: 7,
            identifier: "app.render".to_string(),
            args: vec![json!(1)],
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "invoke");
        assert_eq!(v["call_id"], 7);
        assert_eq!(v["args"][0], 1);
    }

    #[test]
    fn error_is_flattened_into_envelope() {
        let msg = ServerMessage::Error(ErrorResponse {
            error: "session_configuration".to_string(),
            message: "boom".to_string(),
        });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["error"], "session_configuration");
        assert_eq!(v["message"], "boom");
    }

    #[test]
    fn connected_omits_empty_components() {
        let msg = ServerMessage::Connected {
            session_id: "abc".to_string(),
            components: vec![],
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert!(v.get("components").is_none());
    }

    #[test]
    fn client_messages_parse() {
        let m: ClientMessage =
            serde_json::from_str(r#"{"type":"invocation_result","call_id":3,"result":"ok"}"#)
                .unwrap();
        assert_eq!(
            m,
            ClientMessage::InvocationResult {
                call_id: 3,
                result: Some(json!("ok")),
                error: None
            }
        );

        let m: ClientMessage = serde_json::from_str(r#"{"type":"event","name":"click"}"#).unwrap();
        assert_eq!(
            m,
            ClientMessage::Event {
                name: "click".to_string(),
                payload: Value::Null
            }
        );

        let m: ClientMessage =
            serde_json::from_str(r#"{"type":"location_changed","uri":"http://h/a"}"#).unwrap();
        assert!(matches!(m, ClientMessage::LocationChanged { uri } if uri == "http://h/a"));
    }
}
