//! # Request/response multiplexer
//!
//! [`Connection`] turns a raw frame-oriented stream into RPC. A plain
//! `send` on a stream gives the other party no way to report success or
//! failure; the multiplexer fixes that by assigning every outbound request
//! a correlation id and parking the caller until the matching response
//! envelope arrives.
//!
//! ## Design
//!
//! - One reader task per connection drives the stream. Response envelopes
//!   are routed to the pending-request table and complete exactly one
//!   awaiting caller; request envelopes are forwarded to the incoming
//!   channel consumed via [`Connection::recv`].
//! - The reader must never be blocked by application handling. Consumers of
//!   [`Connection::recv`] spawn a task per request; a handler that awaits
//!   its own nested requests would otherwise starve response delivery and
//!   deadlock.
//! - A pending-table entry lives from the moment the request frame is
//!   written until its response arrives or the caller gives up. Release is
//!   guaranteed by a drop guard, so a cancelled caller cannot leak its
//!   entry; a response arriving afterwards is logged and dropped as
//!   unknown.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::{ActionRequest, Envelope};

/// Errors surfaced by the multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("transport failure: {0}")]
    Transport(#[from] LinesCodecError),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    #[error("request rejected by the remote peer")]
    Rejected { payload: Value },

    #[error("request failed after {tries} attempts")]
    FailedRequest { tries: u32 },

    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// An unsolicited request envelope yielded to the application.
///
/// The application must answer it with [`Connection::report_success`] or
/// [`Connection::report_failure`], echoing `id`.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub id: Uuid,
    pub payload: Value,
}

/// The slot a response lands in while a caller awaits it.
#[derive(Debug)]
struct ResponseBody {
    success: bool,
    payload: Value,
}

/// Live pending-request entries plus the closed flag, under one lock so a
/// request can never be installed after the reader has torn the table
/// down.
#[derive(Default)]
struct Pending {
    entries: HashMap<Uuid, oneshot::Sender<ResponseBody>>,
    closed: bool,
}

type PendingTable = Arc<Mutex<Pending>>;
type BoxedSink = Pin<Box<dyn Sink<String, Error = LinesCodecError> + Send>>;

/// RPC semantics over a full-duplex message stream.
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Both sides of
/// the bus embed one `Connection` per stream.
pub struct Connection {
    writer: tokio::sync::Mutex<BoxedSink>,
    pending: PendingTable,
    incoming: tokio::sync::Mutex<mpsc::Receiver<IncomingRequest>>,
    reader: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Wrap a bidirectional byte stream in the envelope protocol.
    ///
    /// Frames are newline-delimited JSON, one envelope per line. The reader
    /// task runs until the stream closes and is aborted when the
    /// `Connection` is dropped.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(stream, LinesCodec::new());
        let (sink, source) = framed.split();
        let pending: PendingTable = Arc::new(Mutex::new(Pending::default()));
        let (incoming_tx, incoming_rx) = mpsc::channel(64);

        let reader = tokio::spawn(read_loop(source, Arc::clone(&pending), incoming_tx));

        let sink: BoxedSink = Box::pin(sink);
        Self {
            writer: tokio::sync::Mutex::new(sink),
            pending,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            reader,
        }
    }

    /// Issue a request and await the matching response payload.
    ///
    /// Transport-level failures (write error, connection drop) sleep
    /// `backoff` and retry, up to `max_tries` total attempts; exhausting
    /// them fails with [`WireError::FailedRequest`]. An applicative
    /// `success=false` response fails immediately with
    /// [`WireError::Rejected`] carrying the failure payload; it is never
    /// retried.
    pub async fn request(
        &self,
        payload: Value,
        max_tries: u32,
        backoff: Duration,
    ) -> Result<Value, WireError> {
        for attempt in 1..=max_tries {
            match self.issue(payload.clone()).await {
                Ok(response) => return Ok(response),
                Err(rejection @ WireError::Rejected { .. }) => return Err(rejection),
                Err(error) => {
                    warn!(attempt, max_tries, error = %error, "request attempt failed");
                    if attempt < max_tries {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(WireError::FailedRequest { tries: max_tries })
    }

    /// Convenience wrapper: `true` iff the request succeeded.
    pub async fn send(&self, payload: Value, max_tries: u32, backoff: Duration) -> bool {
        match self.request(payload, max_tries, backoff).await {
            Ok(_) => true,
            Err(error) => {
                warn!(error = %error, "sending message failed");
                false
            }
        }
    }

    /// Shorthand for a request whose payload follows the `{action, data}`
    /// convention.
    pub async fn action(
        &self,
        action: &str,
        data: Value,
        max_tries: u32,
        backoff: Duration,
    ) -> Result<Value, WireError> {
        let payload = serde_json::to_value(ActionRequest {
            action: action.to_string(),
            data,
        })?;
        self.request(payload, max_tries, backoff).await
    }

    /// Receive the next unsolicited request envelope.
    ///
    /// Returns `None` once the underlying stream has closed. Response
    /// envelopes are consumed by the reader task and never surface here.
    pub async fn recv(&self) -> Option<IncomingRequest> {
        self.incoming.lock().await.recv().await
    }

    /// Answer a request with a success response.
    pub async fn report_success(&self, id: Uuid, payload: Value) -> Result<(), WireError> {
        self.write_envelope(&Envelope::response(id, true, payload))
            .await
    }

    /// Answer a request with a failure response.
    pub async fn report_failure(&self, id: Uuid, payload: Value) -> Result<(), WireError> {
        self.write_envelope(&Envelope::response(id, false, payload))
            .await
    }

    /// One request attempt: install the pending entry, write the frame,
    /// park on the completion slot.
    async fn issue(&self, payload: Value) -> Result<Value, WireError> {
        let envelope = Envelope::request(payload);
        let id = envelope.id();

        let (completion_tx, completion_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending table lock poisoned");
            if pending.closed {
                return Err(WireError::ConnectionClosed);
            }
            pending.entries.insert(id, completion_tx);
        }
        // Removes the entry on every exit path, including cancellation.
        let _guard = PendingGuard {
            id,
            pending: Arc::clone(&self.pending),
        };

        self.write_envelope(&envelope).await?;

        let response = completion_rx
            .await
            .map_err(|_| WireError::ConnectionClosed)?;
        if response.success {
            Ok(response.payload)
        } else {
            Err(WireError::Rejected {
                payload: response.payload,
            })
        }
    }

    async fn write_envelope(&self, envelope: &Envelope) -> Result<(), WireError> {
        let line = serde_json::to_string(envelope)?;
        let mut writer = self.writer.lock().await;
        writer.send(line.clone()).await?;
        debug!(frame = %line, "sent");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Guaranteed-release scope for a pending-request entry.
struct PendingGuard {
    id: Uuid,
    pending: PendingTable,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.entries.remove(&self.id);
        }
    }
}

/// Reader task: routes responses to pending callers, forwards requests to
/// the incoming channel, skips malformed frames.
async fn read_loop<S>(
    mut source: futures::stream::SplitStream<Framed<S, LinesCodec>>,
    pending: PendingTable,
    incoming_tx: mpsc::Sender<IncomingRequest>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    while let Some(frame) = source.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(error) => {
                warn!(error = %error, "stream read failed");
                break;
            }
        };
        debug!(frame = %line, "received");

        let envelope: Envelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(error = %error, "discarding malformed frame");
                continue;
            }
        };

        match envelope {
            Envelope::Response {
                id,
                success,
                payload,
            } => {
                let slot = pending
                    .lock()
                    .expect("pending table lock poisoned")
                    .entries
                    .remove(&id);
                match slot {
                    // A send fails only if the caller has since been
                    // cancelled; the response is then dropped.
                    Some(completion) => {
                        let _ = completion.send(ResponseBody { success, payload });
                    }
                    // Either a duplicate response (first one won) or a
                    // late response to an abandoned request.
                    None => warn!(%id, "dropping response to an unknown request"),
                }
            }
            Envelope::Request { id, payload } => {
                if incoming_tx
                    .send(IncomingRequest { id, payload })
                    .await
                    .is_err()
                {
                    // Nobody is consuming requests anymore; keep draining
                    // the stream so responses still get routed.
                    debug!(%id, "incoming channel closed, request dropped");
                }
            }
        }
    }

    // Stream closed: refuse new requests and wake every parked caller
    // with a transport failure by dropping its completion slot.
    let mut pending = pending.lock().expect("pending table lock poisoned");
    pending.closed = true;
    pending.entries.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(5);

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        (
            Arc::new(Connection::new(left)),
            Arc::new(Connection::new(right)),
        )
    }

    /// Answer every incoming request by echoing its payload.
    fn spawn_echo_responder(connection: Arc<Connection>) {
        tokio::spawn(async move {
            while let Some(request) = connection.recv().await {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move {
                    connection
                        .report_success(request.id, request.payload)
                        .await
                        .unwrap();
                });
            }
        });
    }

    #[tokio::test]
    async fn request_resolves_with_matching_response() {
        let (client, server) = pair();
        spawn_echo_responder(server);

        let response = timeout(WAIT, client.request(json!("ping"), 1, TICK))
            .await
            .expect("timeout")
            .expect("request failed");
        assert_eq!(response, json!("ping"));
    }

    #[tokio::test]
    async fn concurrent_requests_see_no_cross_talk() {
        let (client, server) = pair();
        spawn_echo_responder(server);

        let requests = (0..16).map(|i| {
            let client = Arc::clone(&client);
            async move { (i, client.request(json!(i), 1, TICK).await.unwrap()) }
        });
        let results = timeout(WAIT, futures::future::join_all(requests))
            .await
            .expect("timeout");

        for (i, response) in results {
            assert_eq!(response, json!(i));
        }
    }

    #[tokio::test]
    async fn rejected_response_fails_immediately_without_retry() {
        let (client, server) = pair();
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        tokio::spawn(async move {
            while let Some(request) = server.recv().await {
                seen.fetch_add(1, Ordering::SeqCst);
                server
                    .report_failure(request.id, json!("denied"))
                    .await
                    .unwrap();
            }
        });

        let error = timeout(WAIT, client.request(json!("op"), 3, TICK))
            .await
            .expect("timeout")
            .expect_err("rejection expected");
        match error {
            WireError::Rejected { payload } => assert_eq!(payload, json!("denied")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_failed_request() {
        let (client, server) = pair();
        drop(server);

        let error = timeout(WAIT, client.request(json!("void"), 2, TICK))
            .await
            .expect("timeout")
            .expect_err("failure expected");
        match error {
            WireError::FailedRequest { tries } => assert_eq!(tries, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn responses_are_never_yielded_as_incoming() {
        let (client, server) = pair();
        spawn_echo_responder(Arc::clone(&server));

        client.request(json!("ping"), 1, TICK).await.unwrap();
        // The response envelope settled the request; nothing may surface
        // through recv.
        let leaked = timeout(Duration::from_millis(100), client.recv()).await;
        assert!(leaked.is_err(), "response leaked into the incoming channel");
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let (raw, stream) = tokio::io::duplex(4096);
        let connection = Connection::new(stream);
        let mut driver = Framed::new(raw, LinesCodec::new());

        driver.send("this is not json".to_string()).await.unwrap();
        let valid = Envelope::request(json!("still alive"));
        driver
            .send(serde_json::to_string(&valid).unwrap())
            .await
            .unwrap();

        let request = timeout(WAIT, connection.recv())
            .await
            .expect("timeout")
            .expect("stream closed");
        assert_eq!(request.payload, json!("still alive"));
    }

    #[tokio::test]
    async fn duplicate_response_is_dropped_and_first_wins() {
        let (raw, stream) = tokio::io::duplex(4096);
        let connection = Arc::new(Connection::new(stream));
        let mut driver = Framed::new(raw, LinesCodec::new());

        let requester = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.request(json!("q"), 1, TICK).await })
        };

        let line = timeout(WAIT, driver.next())
            .await
            .expect("timeout")
            .expect("stream closed")
            .unwrap();
        let id = serde_json::from_str::<Envelope>(&line).unwrap().id();

        for payload in ["first", "second"] {
            let response = Envelope::response(id, true, json!(payload));
            driver
                .send(serde_json::to_string(&response).unwrap())
                .await
                .unwrap();
        }

        let response = timeout(WAIT, requester)
            .await
            .expect("timeout")
            .unwrap()
            .unwrap();
        assert_eq!(response, json!("first"));

        // The duplicate must not have desynchronized the reader.
        let followup = Envelope::request(json!("follow-up"));
        driver
            .send(serde_json::to_string(&followup).unwrap())
            .await
            .unwrap();
        let request = timeout(WAIT, connection.recv())
            .await
            .expect("timeout")
            .expect("stream closed");
        assert_eq!(request.payload, json!("follow-up"));
    }

    #[tokio::test]
    async fn recv_returns_none_when_stream_closes() {
        let (raw, stream) = tokio::io::duplex(4096);
        let connection = Connection::new(stream);
        drop(raw);

        let closed = timeout(WAIT, connection.recv()).await.expect("timeout");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn send_reports_outcome_as_bool() {
        let (client, server) = pair();
        spawn_echo_responder(server);
        assert!(client.send(json!("ok"), 1, TICK).await);

        let (orphan, gone) = pair();
        drop(gone);
        assert!(!orphan.send(json!("lost"), 1, TICK).await);
    }

    #[tokio::test]
    async fn action_wraps_name_and_data() {
        let (client, server) = pair();
        tokio::spawn(async move {
            while let Some(request) = server.recv().await {
                let parsed: ActionRequest = serde_json::from_value(request.payload).unwrap();
                assert_eq!(parsed.action, "get_public_key");
                server
                    .report_success(request.id, parsed.data)
                    .await
                    .unwrap();
            }
        });

        let response = timeout(WAIT, client.action("get_public_key", json!("bob"), 1, TICK))
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(response, json!("bob"));
    }
}
