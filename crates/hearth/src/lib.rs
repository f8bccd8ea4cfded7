//! # Hearth
//!
//! Session layer for clustered, transactional game servers.
//!
//! Hearth terminates client connections, speaks a compact framed binary
//! protocol, and delivers application output to clients in the order the
//! producing transactions committed, even when the client's connection is
//! held by another node. Sessions can move between nodes without the client
//! logging in again.
//!
//! ## Layers
//!
//! - [`engine`]: one protocol state machine per connection
//! - [`SessionService`]: login, suspend, relocate, and disconnect per node
//! - [`hearth_delivery`]: transactional, commit-ordered output
//! - node-to-node forwarding over a small JSON RPC
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hearth::prelude::*;
//!
//! struct OpenDoor;
//!
//! impl Authenticator for OpenDoor {
//!     async fn authenticate(&self, name: &str, _password: &str) -> Result<Identity, SessionError> {
//!         Ok(Identity::new(name))
//!     }
//! }
//!
//! # async fn start() -> Result<(), HearthError> {
//! let server = HearthServerBuilder::new()
//!     .config(NodeConfig::default())
//!     .build(OpenDoor)
//!     .await?;
//! server.run().await
//! # }
//! ```

#![allow(async_fn_in_trait)]

mod cluster;
mod config;
pub mod engine;
mod error;
mod forward;
mod handle;
mod relocation;
mod server;
mod service;

pub use cluster::{ClusterMap, InMemoryCluster};
pub use config::NodeConfig;
pub use error::{ConfigError, EngineError, ForwardError, HearthError, LoginError};
pub use forward::MAX_RPC_FRAME;
pub use server::{ClientTransport, HearthServer, HearthServerBuilder};
pub use hearth_transport::TcpTransport;
#[cfg(feature = "websocket")]
pub use hearth_transport::WebSocketTransport;
pub use service::{NoopListener, SessionListener, SessionOutput, SessionService};

/// Convenience re-exports for applications.
pub mod prelude {
    pub use crate::{
        ClientTransport, ClusterMap, EngineError, HearthError, HearthServer, HearthServerBuilder,
        InMemoryCluster, LoginError, NodeConfig, NoopListener, SessionListener, SessionOutput,
        SessionService,
    };
    pub use bytes::Bytes;
    pub use hearth_delivery::{DeliveryError, TransactionContext};
    pub use hearth_protocol::{ChannelId, Delivery, ProtocolDescriptor};
    pub use hearth_session::{
        Authenticator, Identity, NodeId, SessionConfig, SessionError, SessionId,
        SessionStatusListener,
    };
}
