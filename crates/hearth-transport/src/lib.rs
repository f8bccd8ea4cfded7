//! Transport abstraction layer for Hearth.
//!
//! Provides the [`Transport`] and [`Connection`] traits that abstract over
//! the byte streams client sessions arrive on. A connection hands the layer
//! above it raw chunks of bytes exactly as the network delivered them; message
//! boundaries are the protocol layer's business.
//!
//! # Feature Flags
//!
//! - `tcp` (default): plain TCP transport ([`TcpTransport`]) and the generic
//!   [`StreamConnection`] over any `AsyncRead + AsyncWrite` stream
//! - `websocket`: WebSocket transport via `tokio-tungstenite`; each binary
//!   WebSocket message is treated as one chunk of the byte stream

#![allow(async_fn_in_trait)]

mod error;
#[cfg(feature = "tcp")]
mod stream;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "tcp")]
pub use stream::{StreamConnection, TcpTransport, DEFAULT_READ_BUFFER_SIZE};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketTransport};

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-unique connection ID.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    fn accept(&mut self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;

    /// Returns the local address the transport is listening on.
    fn local_addr(&self) -> Result<SocketAddr, Self::Error>;

    /// Gracefully shuts down the transport, stopping new connections.
    fn shutdown(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A single connection that can send and receive bytes.
///
/// Implementations must allow one `send` and one `recv` to be in progress at
/// the same time (full duplex). Callers are responsible for never issuing two
/// concurrent sends or two concurrent receives.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Writes all of `data` to the remote peer.
    fn send(&self, data: &[u8]) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Receives the next chunk of bytes from the remote peer.
    ///
    /// A chunk may hold part of a protocol message, or several. Returns
    /// `Ok(None)` when the connection is cleanly closed.
    fn recv(&self) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    /// Closes the connection. Closing twice is not an error.
    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}
