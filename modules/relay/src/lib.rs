//! # Relay service
//!
//! The central rendezvous of the courier message bus. Clients register
//! over a framed stream; the relay keeps a directory of live connections
//! and public keys, forwards opaque ciphertexts between clients, and
//! stores no messages.

pub mod actions;
pub mod config;
pub mod directory;
pub mod dispatcher;
