//! Error types for the session layer.

use crate::{NodeId, SessionId};

/// Errors raised while authenticating, registering, or relocating sessions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The [`Authenticator`](crate::Authenticator) rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A session with this id is already registered on this node.
    #[error("session {0} is already registered")]
    AlreadyRegistered(SessionId),

    /// No session with this id is registered on this node.
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// The relocation key does not match any pending relocation.
    #[error("unknown relocation key")]
    InvalidRelocationKey,

    /// The relocation key was valid but the client arrived too late.
    #[error("relocation of session {0} expired")]
    RelocationExpired(SessionId),

    /// A relocation is already pending under this key.
    #[error("relocation key already in use")]
    DuplicateRelocationKey,

    /// Relocating to the node the session already lives on.
    #[error("session {session} already lives on {node}")]
    SameNode { session: SessionId, node: NodeId },
}
