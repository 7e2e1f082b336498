//! # Wire protocol for the courier message bus
//!
//! The shared runtime capability both the relay and every endpoint embed:
//! the envelope protocol and the request/response multiplexer that runs
//! over a single bidirectional stream per peer.
//!
//! ## Layers
//!
//! - [`Envelope`]: one framed JSON message, either a request or a response,
//!   correlated by UUID.
//! - [`Connection`]: RPC over a full-duplex stream: issue a request and
//!   await its reply, iterate unsolicited incoming requests, report
//!   success/failure for requests received.
//!
//! Frames are newline-delimited JSON text. The transport is any
//! `AsyncRead + AsyncWrite` stream; production uses `tokio::net::TcpStream`,
//! tests use in-memory duplex pipes.

mod connection;
mod envelope;

pub use connection::{Connection, IncomingRequest, WireError};
pub use envelope::{ActionRequest, Envelope};
