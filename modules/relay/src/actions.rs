//! # Relay action table
//!
//! Every request a registered client sends to the relay carries an
//! `{action, data}` payload. The two built-in actions are `send_message`
//! (forward an opaque ciphertext to another client and relay back its
//! response) and `get_public_key` (look up a client's registered key,
//! waiting for the registration if necessary).
//!
//! Actions return a tagged outcome instead of raising through the
//! dispatcher; the dispatcher translates `Err` into a failure response, so
//! every request gets exactly one response.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use wire::{ActionRequest, WireError};

use crate::directory::Directory;

/// Backoff for the single-attempt nested request used when forwarding; the
/// relay does not retry on the recipient's behalf.
const FORWARD_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid action data: {0}")]
    InvalidData(#[from] serde_json::Error),

    #[error("Message sent by {sender_id} was not received by {recipient_id}!")]
    NotDelivered {
        sender_id: String,
        recipient_id: String,
        /// The recipient's failure payload, if it reported one.
        detail: Value,
    },
}

impl ActionError {
    /// The diagnostic payload surfaced to the original sender.
    ///
    /// When the recipient reported a failure with a payload of its own,
    /// that payload passes through verbatim; otherwise the error's
    /// advisory string is used.
    pub fn payload(&self) -> Value {
        match self {
            ActionError::NotDelivered { detail, .. } if !detail.is_null() => detail.clone(),
            other => Value::String(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendMessageData {
    recipient_id: String,
    message: Value,
}

/// Look up and run the action named by `payload`.
pub async fn dispatch(
    directory: &Directory,
    payload: Value,
    sender_id: &str,
) -> Result<Value, ActionError> {
    let request: ActionRequest = serde_json::from_value(payload)?;
    match request.action.as_str() {
        "send_message" => send_message(directory, request.data, sender_id).await,
        "get_public_key" => get_public_key(directory, request.data).await,
        other => Err(ActionError::UnknownAction(other.to_string())),
    }
}

/// The public key `client_id` registered with, waiting for the
/// registration if the client is not known yet.
async fn get_public_key(directory: &Directory, data: Value) -> Result<Value, ActionError> {
    let client_id: String = serde_json::from_value(data)?;
    let info = directory.info_by_id(&client_id).await;
    Ok(Value::String(info.public_key))
}

/// Forward a message from `sender_id` to the recipient and return the
/// recipient's response payload verbatim.
///
/// The relay never inspects `message`; it is an opaque ciphertext. If the
/// recipient is not registered yet the action waits for it to appear. If
/// the recipient does not confirm the reception the action fails.
async fn send_message(
    directory: &Directory,
    data: Value,
    sender_id: &str,
) -> Result<Value, ActionError> {
    let data: SendMessageData = serde_json::from_value(data)?;
    debug!(recipient_id = %data.recipient_id, "sending message");
    let recipient = directory.connection_by_id(&data.recipient_id).await;
    debug!(recipient_id = %data.recipient_id, "recipient connection found");

    let payload = json!({ "sender_id": sender_id, "message": data.message });
    match recipient.request(payload, 1, FORWARD_BACKOFF).await {
        Ok(response) => {
            debug!(recipient_id = %data.recipient_id, "message received");
            Ok(response)
        }
        Err(WireError::Rejected { payload }) => Err(ActionError::NotDelivered {
            sender_id: sender_id.to_string(),
            recipient_id: data.recipient_id,
            detail: payload,
        }),
        Err(error) => {
            warn!(error = %error, "sending message failed");
            Err(ActionError::NotDelivered {
                sender_id: sender_id.to_string(),
                recipient_id: data.recipient_id,
                detail: Value::Null,
            })
        }
    }
}
