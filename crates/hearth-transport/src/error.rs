//! Error type for the transport layer.

/// Errors that can occur while accepting, reading from, or writing to a
/// client connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The listener could not be bound to the requested address.
    #[error("bind to {addr} failed: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Accepting (or upgrading) an incoming connection failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// Writing to the peer failed. The connection should be considered dead.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Reading from the peer failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// The operation was attempted on a connection that is already closed.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Returns `true` for errors after which the connection cannot be used.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::BindFailed { .. } | Self::AcceptFailed(_))
    }
}
