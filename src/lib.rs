//! Rendezchat library: shared modules for the binary and integration tests.
//!
//! Exposes the wire envelope, the rendezvous server and the chat client so
//! integration tests can run both ends of the protocol in one process.

pub mod common;
pub mod config;
pub mod network;
