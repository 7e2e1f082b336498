//! # Connection dispatcher
//!
//! For each accepted stream: wrap it in the envelope multiplexer, complete
//! the registration handshake, then iterate incoming requests and run each
//! through the action table.
//!
//! Request handling inside the receive loop must be non-blocking. A request
//! may depend on receiving further information (`send_message` awaits the
//! recipient's reply, which arrives as a frame on the recipient's stream,
//! and `get_public_key` may wait for a registration), but frames are only
//! read while the loop progresses. Handling a request inline would
//! therefore deadlock; every request is spawned as its own task.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use wire::{Connection, IncomingRequest};

use crate::actions;
use crate::directory::Directory;

/// Accept connections forever, dispatching each onto its own task.
pub async fn serve(listener: TcpListener, directory: Arc<Directory>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "accepted connection");
        tokio::spawn(handle_connection(stream, Arc::clone(&directory)));
    }
}

/// Drive one client connection from registration to disconnect.
pub async fn handle_connection(stream: TcpStream, directory: Arc<Directory>) {
    let connection = Arc::new(Connection::new(stream));

    let client_id = match directory.register(Arc::clone(&connection)).await {
        Ok(id) => id,
        Err(error) => {
            warn!(error = %error, "registration failed");
            return;
        }
    };

    while let Some(request) = connection.recv().await {
        let directory = Arc::clone(&directory);
        let connection = Arc::clone(&connection);
        let client_id = client_id.clone();
        tokio::spawn(async move {
            handle_request(&directory, &connection, request, &client_id).await;
        });
    }

    info!("Connection with client {client_id} closed.");
    directory.deregister(&client_id);
}

async fn handle_request(
    directory: &Directory,
    connection: &Connection,
    request: IncomingRequest,
    client_id: &str,
) {
    let written = match actions::dispatch(directory, request.payload, client_id).await {
        Ok(response) => connection.report_success(request.id, response).await,
        Err(error) => {
            warn!(client_id = %client_id, error = %error, "action failed");
            connection.report_failure(request.id, error.payload()).await
        }
    };
    if let Err(error) = written {
        warn!(error = %error, "failed to write response");
    }
}
