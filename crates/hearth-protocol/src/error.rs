//! Error types for the protocol layer.
//!
//! Every variant except [`ProtocolError::MessageTooLong`] describes a protocol
//! violation by the peer (or a broken transport underneath it), and the
//! connection engine treats those as fatal for the connection. Oversized
//! outbound messages are rejected synchronously to the caller instead.

use hearth_transport::TransportError;

/// Errors that can occur while framing, encoding, or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// An inter-node RPC payload could not be serialized.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// An inter-node RPC payload could not be deserialized.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// A message body ended before a field could be read.
    #[error("truncated message: {field} needs {needed} bytes, {remaining} left")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    /// The first byte of a message body is not a known opcode.
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    /// A frame with a zero length prefix (no opcode) was received.
    #[error("empty frame")]
    EmptyFrame,

    /// A message, or its payload, exceeds the protocol maximum. Raised before
    /// any bytes are queued.
    #[error("message too long: {len} > {max}")]
    MessageTooLong { len: usize, max: usize },

    /// The client speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    /// The message is well-framed but violates protocol rules (bad UTF-8,
    /// oversized channel id, trailing bytes, ...).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A second read was issued while one is already outstanding.
    #[error("read already pending")]
    ReadPending,

    /// The read buffer size is too small to hold a length prefix.
    #[error("read buffer size {size} is smaller than the {min}-byte prefix")]
    ReadBufferTooSmall { size: usize, min: usize },

    /// The underlying connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
