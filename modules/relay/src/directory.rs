//! # Client directory
//!
//! Tracks live client connections and the metadata they provided during
//! registration, and lets callers rendezvous with clients that have not
//! registered yet: a lookup for an unknown id parks on a one-shot
//! registration waiter until that id registers.
//!
//! The directory is owned by the relay instance that accepts the
//! connections; its lifecycle is the relay's lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};
use wire::{Connection, WireError};

/// Metadata a client provides in its registration request.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub public_key: String,
}

#[derive(Clone)]
struct Entry {
    info: ClientInfo,
    connection: Arc<Connection>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("connection closed before registration")]
    ConnectionClosed,

    #[error("invalid registration payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Default)]
struct Inner {
    clients: HashMap<String, Entry>,
    waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
}

/// Registry of live endpoints, keyed by client id.
///
/// At most one entry per id at any instant; a re-registration under a live
/// id replaces the previous entry (the old connection is assumed dead).
#[derive(Default)]
pub struct Directory {
    inner: Mutex<Inner>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete a client's registration handshake.
    ///
    /// Reads exactly one envelope from the connection; its payload is the
    /// client metadata. Stores the entry, wakes every caller parked on this
    /// id, and acknowledges with a success response echoing the request id.
    pub async fn register(
        &self,
        connection: Arc<Connection>,
    ) -> Result<String, RegistrationError> {
        let request = connection
            .recv()
            .await
            .ok_or(RegistrationError::ConnectionClosed)?;
        let info: ClientInfo = serde_json::from_value(request.payload)?;
        let id = info.id.clone();
        let client_display = format!("{} {} {}", info.id, info.first_name, info.last_name);

        let woken = {
            let mut inner = self.inner.lock().expect("directory lock poisoned");
            let replaced = inner.clients.insert(
                id.clone(),
                Entry {
                    info,
                    connection: Arc::clone(&connection),
                },
            );
            if replaced.is_some() {
                warn!(client_id = %id, "replacing a previous registration under the same id");
            }
            inner.waiters.remove(&id)
        };
        // Waiters whose caller has since been cancelled dropped their
        // receiver; the send is then a no-op.
        for waiter in woken.into_iter().flatten() {
            let _ = waiter.send(());
        }

        connection.report_success(request.id, Value::Null).await?;
        info!("Client {client_display} registered.");
        Ok(id)
    }

    /// The connection installed by `id`'s registration, waiting for the
    /// registration if it has not happened yet.
    pub async fn connection_by_id(&self, id: &str) -> Arc<Connection> {
        self.entry(id).await.connection
    }

    /// The metadata provided during `id`'s registration, waiting for the
    /// registration if it has not happened yet.
    pub async fn info_by_id(&self, id: &str) -> ClientInfo {
        self.entry(id).await.info
    }

    /// Remove `id` from the directory. Idempotent. Parked waiters are
    /// unaffected and continue to wait for the next registration.
    pub fn deregister(&self, id: &str) {
        let removed = self
            .inner
            .lock()
            .expect("directory lock poisoned")
            .clients
            .remove(id);
        if removed.is_some() {
            info!("Client {id} deregistered.");
        }
    }

    async fn entry(&self, id: &str) -> Entry {
        loop {
            let waiter = {
                let mut inner = self.inner.lock().expect("directory lock poisoned");
                if let Some(entry) = inner.clients.get(id) {
                    return entry.clone();
                }
                let (signal_tx, signal_rx) = oneshot::channel();
                inner
                    .waiters
                    .entry(id.to_string())
                    .or_default()
                    .push(signal_tx);
                signal_rx
            };
            // One-shot: fires when `register` installs the entry. An error
            // means the sender was dropped without firing; re-check.
            let _ = waiter.await;
        }
    }
}
