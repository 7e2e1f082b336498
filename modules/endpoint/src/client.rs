//! # Endpoint base
//!
//! The client side of the bus: registers with the relay, executes the
//! configured outbound actions, and serves incoming messages. All payloads
//! that cross the relay are encrypted under the recipient's public key;
//! the base handles key resolution, encryption, and the authentication
//! reply path, and delegates application semantics to a [`Handler`].
//!
//! ## Lifecycle
//!
//! [`Endpoint::run`] registers, then concurrently drives the receive loop
//! and one task per configured outbound action, all bounded by the
//! configured session duration; hitting the deadline is the normal
//! shutdown. Every incoming request is scheduled on its own task so a
//! handler awaiting nested requests (the bank's challenge-response does
//! exactly that) never starves response delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use wire::{Connection, IncomingRequest, WireError};

use crate::config::{ConfigError, EndpointConfig, OutboundAction};
use crate::crypto::{Cipher, CryptoError};
use crate::ledger::LedgerError;

/// Prefix of the challenge-response authentication message.
pub const AUTH_PREFIX: &str = "AUTH ";

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to connect to relay at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to register.")]
    Registration,

    #[error("unexpected payload shape: {0}")]
    UnexpectedPayload(String),

    #[error("ledger failure: {0}")]
    Ledger(#[source] LedgerError),

    /// Application-level failure with an advisory message that is
    /// reported back to the remote peer.
    #[error("{0}")]
    Rejected(String),
}

impl EndpointError {
    /// The payload carried by a failure reply: the advisory message for
    /// application-level failures, explicit null for everything else.
    fn advisory(&self) -> Value {
        match self {
            EndpointError::Rejected(message) => Value::String(message.clone()),
            _ => Value::Null,
        }
    }
}

impl From<LedgerError> for EndpointError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::Database(_) => EndpointError::Ledger(error),
            // Applicative rejections surface their message to the sender.
            other => EndpointError::Rejected(other.to_string()),
        }
    }
}

/// Where an endpoint resolves peer public keys.
pub enum KeySource {
    /// Ask the relay via the `get_public_key` action.
    Relay,
    /// A local id → key table (the bank resolves persons from its
    /// permission file instead of trusting the relay).
    Local(HashMap<String, String>),
}

/// Application hook for decrypted incoming messages.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle a message from `sender_id`. The returned text, if any, is
    /// encrypted for the sender and becomes the success payload of the
    /// reply; an `Err` becomes a failure reply carrying the advisory
    /// message when there is one.
    async fn receive_message(
        &self,
        sender_id: &str,
        message: &str,
    ) -> Result<Option<String>, EndpointError>;
}

#[derive(Debug, Deserialize)]
struct InboundMessage {
    sender_id: String,
    message: Option<String>,
}

/// A connected participant of the bus.
pub struct Endpoint {
    id: String,
    first_name: String,
    last_name: String,
    public_key: String,
    retries: u32,
    backoff: Duration,
    duration: Duration,
    cipher: Cipher,
    key_source: KeySource,
    connection: Arc<Connection>,
}

impl Endpoint {
    /// Open the transport to the relay and import the private key; the
    /// cipher is held for the process's lifetime.
    pub async fn connect(
        config: &EndpointConfig,
        key_source: KeySource,
    ) -> Result<Arc<Self>, EndpointError> {
        let (first_name, last_name) = config.split_name()?;
        let cipher = Cipher::new(&config.person.keys.private)?;

        let addr = format!("{}:{}", config.server.ip, config.server.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| EndpointError::Connect {
                addr: addr.clone(),
                source,
            })?;
        info!("Connected to relay at {addr}");

        Ok(Arc::new(Self {
            id: config.person.id.clone(),
            first_name,
            last_name,
            public_key: config.person.keys.public.clone(),
            retries: config.general.retries,
            backoff: Duration::from_secs(config.general.timeout),
            duration: Duration::from_secs(config.general.duration),
            cipher,
            key_source,
            connection: Arc::new(Connection::new(stream)),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the endpoint session: register, then serve incoming messages
    /// and execute the configured outbound actions concurrently until the
    /// session duration elapses or the connection closes.
    ///
    /// Registration failure is fatal; the session deadline is the normal
    /// shutdown.
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn Handler>,
        actions: Vec<OutboundAction>,
    ) -> Result<(), EndpointError> {
        let session = async {
            self.register().await?;

            let receive = Arc::clone(&self).receive_messages(handler);
            let outbound = async {
                let sends = actions.iter().map(|action| {
                    let endpoint = Arc::clone(&self);
                    async move {
                        if let Err(error) = endpoint
                            .send_message(&action.recipient_id, &action.message)
                            .await
                        {
                            warn!(
                                recipient_id = %action.recipient_id,
                                error = %error,
                                "outbound action failed"
                            );
                        }
                    }
                });
                futures::future::join_all(sends).await;
            };
            tokio::join!(receive, outbound);
            Ok(())
        };

        match tokio::time::timeout(self.duration, session).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                info!("Session duration elapsed, shutting down.");
                Ok(())
            }
        }
    }

    async fn register(&self) -> Result<(), EndpointError> {
        let info = json!({
            "id": self.id,
            "first_name": self.first_name,
            "last_name": self.last_name,
            "public_key": self.public_key,
        });
        if self.connection.send(info, self.retries, self.backoff).await {
            info!("Registered.");
            Ok(())
        } else {
            Err(EndpointError::Registration)
        }
    }

    /// Encrypt `plaintext` for the recipient, deliver it through the
    /// relay, and decrypt the recipient's reply (if any).
    pub async fn send_message(
        &self,
        recipient_id: &str,
        plaintext: &str,
    ) -> Result<Option<String>, EndpointError> {
        debug!("Message before encryption: {plaintext}");
        let encrypted = self.encrypt_for(recipient_id, plaintext).await?;

        let data = json!({"recipient_id": recipient_id, "message": encrypted});
        let response = self
            .connection
            .action("send_message", data, self.retries, self.backoff)
            .await?;
        info!("Message delivered to {recipient_id}");

        match response {
            Value::Null => Ok(None),
            Value::String(ciphertext) => Ok(Some(self.cipher.decrypt(&ciphertext)?)),
            other => Err(EndpointError::UnexpectedPayload(other.to_string())),
        }
    }

    async fn encrypt_for(
        &self,
        recipient_id: &str,
        plaintext: &str,
    ) -> Result<String, EndpointError> {
        let key = self.public_key_for(recipient_id).await?;
        Ok(Cipher::encrypt(plaintext, &key)?)
    }

    async fn public_key_for(&self, peer_id: &str) -> Result<String, EndpointError> {
        match &self.key_source {
            KeySource::Local(keys) => keys.get(peer_id).cloned().ok_or_else(|| {
                EndpointError::Rejected(format!("No public key on file for {peer_id}!"))
            }),
            KeySource::Relay => {
                let response = self
                    .connection
                    .action("get_public_key", json!(peer_id), 1, self.backoff)
                    .await?;
                match response {
                    Value::String(key) => Ok(key),
                    other => Err(EndpointError::UnexpectedPayload(other.to_string())),
                }
            }
        }
    }

    async fn receive_messages(self: Arc<Self>, handler: Arc<dyn Handler>) {
        while let Some(request) = self.connection.recv().await {
            let endpoint = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                endpoint.handle_message(request, handler).await;
            });
            debug!("Message scheduled for handling.");
        }
        warn!("Connection to relay closed.");
    }

    async fn handle_message(&self, request: IncomingRequest, handler: Arc<dyn Handler>) {
        let written = match self.process_message(request.payload, handler).await {
            Ok(reply) => {
                let payload = reply.map(Value::String).unwrap_or(Value::Null);
                self.connection.report_success(request.id, payload).await
            }
            Err(failure) => {
                error!(error = %failure, "Failed to handle message");
                self.connection
                    .report_failure(request.id, failure.advisory())
                    .await
            }
        };
        if let Err(error) = written {
            warn!(error = %error, "failed to write reply");
        }
    }

    /// Decrypt an inbound payload, serve the authentication reply path, or
    /// hand off to the application handler. The returned string is already
    /// encrypted for the sender.
    async fn process_message(
        &self,
        payload: Value,
        handler: Arc<dyn Handler>,
    ) -> Result<Option<String>, EndpointError> {
        let inbound: InboundMessage = serde_json::from_value(payload)
            .map_err(|error| EndpointError::UnexpectedPayload(error.to_string()))?;
        let ciphertext = inbound
            .message
            .ok_or_else(|| EndpointError::UnexpectedPayload("missing message".to_string()))?;
        let plaintext = self.cipher.decrypt(&ciphertext)?;
        debug!("Received message: {plaintext}");

        if let Some(token) = plaintext.strip_prefix(AUTH_PREFIX) {
            info!("Requested to authenticate by {}", inbound.sender_id);
            let reply = self.encrypt_for(&inbound.sender_id, token).await?;
            info!("Responded to authentication request by {}", inbound.sender_id);
            return Ok(Some(reply));
        }

        match handler.receive_message(&inbound.sender_id, &plaintext).await? {
            Some(text) => Ok(Some(self.encrypt_for(&inbound.sender_id, &text).await?)),
            None => Ok(None),
        }
    }
}
