//! # Wire Envelope
//!
//! Every frame on a courier stream is exactly one envelope, a JSON object
//! tagged by `type`:
//!
//! - request:  `{"id": "<uuid>", "type": "request",  "payload": <any>}`
//! - response: `{"id": "<uuid>", "type": "response", "success": <bool>, "payload": <any>}`
//!
//! Correlation is by `id`: the party issuing a request generates a fresh
//! UUID v4 and the reply echoes it. Responses carry a success flag; on
//! failure `payload` may carry an application-level failure description,
//! otherwise it is `null`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One framed message on the stream, either a request or a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Request {
        id: Uuid,
        payload: Value,
    },
    Response {
        id: Uuid,
        success: bool,
        payload: Value,
    },
}

impl Envelope {
    /// Create a request envelope with a freshly generated correlation id.
    pub fn request(payload: Value) -> Self {
        Envelope::Request {
            id: Uuid::new_v4(),
            payload,
        }
    }

    /// Create a response envelope echoing the correlation id of the request
    /// it answers.
    pub fn response(id: Uuid, success: bool, payload: Value) -> Self {
        Envelope::Response {
            id,
            success,
            payload,
        }
    }

    /// The correlation id carried by this envelope.
    pub fn id(&self) -> Uuid {
        match self {
            Envelope::Request { id, .. } => *id,
            Envelope::Response { id, .. } => *id,
        }
    }
}

/// The `{action, data}` payload convention used for named operations.
///
/// A request whose payload follows this shape invokes the named action on
/// the receiving side; `data` is the action-specific argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips_through_json() {
        let envelope = Envelope::request(json!({"hello": "world"}));
        let line = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn request_wire_shape_matches_protocol() {
        let envelope = Envelope::request(json!("ping"));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["payload"], "ping");
        // UUIDs serialize as lowercase hyphenated v4
        let id = value["id"].as_str().unwrap();
        assert_eq!(id, id.to_lowercase());
        assert_eq!(id.len(), 36);
    }

    #[test]
    fn response_wire_shape_matches_protocol() {
        let id = Uuid::new_v4();
        let envelope = Envelope::response(id, false, json!("denied"));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["success"], false);
        assert_eq!(value["payload"], "denied");
        assert_eq!(value["id"], id.to_string());
    }

    #[test]
    fn null_payload_is_explicit() {
        let envelope = Envelope::response(Uuid::new_v4(), true, Value::Null);
        let line = serde_json::to_string(&envelope).unwrap();
        assert!(line.contains("\"payload\":null"));
    }

    #[test]
    fn action_request_shape() {
        let payload = serde_json::to_value(ActionRequest {
            action: "get_public_key".to_string(),
            data: json!("alice"),
        })
        .unwrap();
        assert_eq!(payload, json!({"action": "get_public_key", "data": "alice"}));
    }
}
