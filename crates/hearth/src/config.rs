//! Node configuration.
//!
//! ```json
//! {
//!   "node_id": 1,
//!   "bind_addr": "0.0.0.0:7400",
//!   "rpc_bind_addr": "0.0.0.0:7500",
//!   "public_host": "game-1.example.net",
//!   "read_buffer_size": 131072,
//!   "disconnect_delay": 1000,
//!   "relocation_timeout": 10000
//! }
//! ```
//!
//! Every field is optional; durations are milliseconds.

use std::path::Path;

use hearth_protocol::PREFIX_LENGTH;
use hearth_session::{NodeId, SessionConfig};
use hearth_transport::DEFAULT_READ_BUFFER_SIZE;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Everything one node needs to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: NodeId,

    /// Where client connections are accepted.
    pub bind_addr: String,

    /// Where other nodes reach this node's session server.
    pub rpc_bind_addr: String,

    /// Host name clients are told to use in redirects and relocation
    /// notifications.
    pub public_host: String,

    /// Bytes each transport read asks for. Values below the frame prefix
    /// length are raised to it.
    pub read_buffer_size: usize,

    #[serde(flatten)]
    pub session: SessionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(1),
            bind_addr: "127.0.0.1:7400".into(),
            rpc_bind_addr: "127.0.0.1:7500".into(),
            public_host: "127.0.0.1".into(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            session: SessionConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parses a JSON document and normalizes it.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        Ok(config.validated())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Returns a copy with out-of-range values replaced by usable ones.
    pub fn validated(self) -> Self {
        if self.read_buffer_size < PREFIX_LENGTH {
            tracing::warn!(
                read_buffer_size = self.read_buffer_size,
                min = PREFIX_LENGTH,
                "read buffer size too small, raising"
            );
        }
        Self {
            read_buffer_size: self.read_buffer_size.max(PREFIX_LENGTH),
            session: self.session.validated(),
            ..self
        }
    }
}
