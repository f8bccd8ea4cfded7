//! Error types for the node crate, and the umbrella [`HearthError`].

use hearth_delivery::DeliveryError;
use hearth_protocol::{ProtocolDescriptor, ProtocolError};
use hearth_session::{NodeId, SessionError, SessionId};
use hearth_transport::TransportError;

/// State conflicts reported synchronously by the connection engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Outbound application messages are held while messages are suspended.
    #[error("messages suspended")]
    Suspended,

    /// Outbound application messages are held while the session relocates.
    #[error("session relocating")]
    Relocating,

    /// `suspend` was requested while a suspend is already active.
    #[error("already suspending messages")]
    AlreadySuspending,

    /// `relocate` was requested while a relocation or suspend is active.
    #[error("session already relocating")]
    AlreadyRelocating,

    /// The connection is closed.
    #[error("connection closed")]
    Closed,
}

/// Failures talking to another node's session server.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The cluster map has no RPC address for the node.
    #[error("no route to {0}")]
    UnknownNode(NodeId),

    #[error("rpc i/o with {node} failed: {source}")]
    Io {
        node: NodeId,
        #[source]
        source: std::io::Error,
    },

    #[error("rpc payload: {0}")]
    Codec(#[from] ProtocolError),

    /// The remote node answered with an error.
    #[error("{node} rejected the request: {message}")]
    Remote { node: NodeId, message: String },

    /// The remote node answered with the wrong response kind.
    #[error("unexpected rpc response from {0}")]
    UnexpectedResponse(NodeId),

    #[error("rpc frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

/// Configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why a login or relocation did not produce a session on this node.
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    /// The identity belongs on another node; the client should reconnect
    /// there.
    #[error("identity is assigned to {node}")]
    Redirect {
        node: NodeId,
        descriptors: Vec<ProtocolDescriptor>,
    },

    /// The application or the authenticator refused the session.
    #[error("refused: {0}")]
    Refused(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Top-level error wrapping every crate-specific error.
///
/// The `#[from]` attributes let `?` convert sub-crate errors.
#[derive(Debug, thiserror::Error)]
pub enum HearthError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Login(#[from] LoginError),

    /// The session is not hosted by this node.
    #[error("session {0} is not hosted here")]
    UnknownSession(SessionId),

    /// Relocation to the node that already hosts the session.
    #[error("session {0} is already on {1}")]
    AlreadyLocal(SessionId, NodeId),

    /// The target node is not in the cluster map.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err: HearthError = TransportError::Closed.into();
        assert!(matches!(err, HearthError::Transport(_)));
    }

    #[test]
    fn test_from_protocol_error() {
        let err: HearthError = ProtocolError::MessageTooLong { len: 70_000, max: 65_524 }.into();
        assert!(matches!(err, HearthError::Protocol(_)));
        assert!(err.to_string().contains("70000"));
    }

    #[test]
    fn test_from_engine_error_keeps_reason() {
        let err: HearthError = EngineError::Relocating.into();
        assert_eq!(err.to_string(), "session relocating");
    }

    #[test]
    fn test_login_error_wraps_session_error() {
        let err: LoginError = SessionError::InvalidRelocationKey.into();
        assert!(matches!(err, LoginError::Session(_)));
    }
}
