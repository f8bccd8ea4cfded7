//! Session identity and bookkeeping for Hearth.
//!
//! This crate answers three questions for a node:
//!
//! 1. **Who is this client?** The [`Authenticator`] trait turns credentials
//!    into an [`Identity`].
//! 2. **Which sessions live here?** The [`SessionDirectory`] maps
//!    [`SessionId`]s to whatever per-session handle the node keeps, and
//!    remembers the relocations the node has agreed to receive.
//! 3. **Who cares when a session leaves?** [`SessionStatusListener`]s are
//!    told about disconnects and relocations.
//!
//! ```text
//! Node service (above)  <- owns the directory, drives login and relocation
//!     |
//! Session layer (this crate)
//!     |
//! Protocol layer (below) <- key length, wire types
//! ```

#![allow(async_fn_in_trait)]

mod auth;
mod directory;
mod error;
mod listener;
mod session;

pub use auth::Authenticator;
pub use directory::{PendingRelocation, SessionDirectory};
pub use error::SessionError;
pub use listener::{SessionStatusListener, StatusListeners};
pub use session::{
    Identity, NodeId, ReconnectKey, RelocationKey, SessionConfig, SessionId, SessionIdGenerator,
    millis,
};
