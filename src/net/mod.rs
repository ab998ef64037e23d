//! Peer-facing networking: wire vocabulary, framing, TLS pinning, and the
//! transport that drives a [`crate::session::Session`] over a connection.

pub mod codec;
pub mod message;
pub mod tls;
pub mod transport;
