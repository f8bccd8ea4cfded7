//! Session identity types.
//!
//! A session is the server's record of one authenticated client. It is
//! identified cluster-wide by a [`SessionId`], proves continuity across
//! reconnects with a [`ReconnectKey`], and moves between nodes by presenting
//! a [`RelocationKey`] to the target.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hearth_protocol::KEY_LENGTH;
use rand::Rng;
use serde::{Deserialize, Serialize};

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        write!(f, "{b:02x}")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Identifies one node of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Globally unique session identifier: the creating node's id followed by a
/// per-node counter, both big-endian.
///
/// The id keeps its value when the session relocates, so the embedded node
/// is where the session was *created*, not where it lives now.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId([u8; 16]);

impl SessionId {
    pub fn new(node: NodeId, counter: u64) -> Self {
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&node.0.to_be_bytes());
        raw[8..].copy_from_slice(&counter.to_be_bytes());
        Self(raw)
    }

    /// The node that created this session.
    pub fn origin(&self) -> NodeId {
        let mut node = [0u8; 8];
        node.copy_from_slice(&self.0[..8]);
        NodeId(u64::from_be_bytes(node))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// Mints session ids for one node.
#[derive(Debug)]
pub struct SessionIdGenerator {
    node: NodeId,
    next: AtomicU64,
}

impl SessionIdGenerator {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        SessionId::new(self.node, self.next.fetch_add(1, Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Who a session belongs to, as established by the
/// [`Authenticator`](crate::Authenticator).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

macro_rules! random_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name([u8; KEY_LENGTH]);

        impl $name {
            /// Draws a fresh key from the thread-local RNG.
            pub fn random() -> Self {
                Self(rand::rng().random())
            }

            /// Parses a key received from the wire. Returns `None` unless
            /// `bytes` is exactly [`KEY_LENGTH`] long.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                <[u8; KEY_LENGTH]>::try_from(bytes).ok().map(Self)
            }

            pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write_hex(f, &self.0[..4])?;
                f.write_str("..")
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({self})", stringify!($name))
            }
        }
    };
}

random_key! {
    /// Secret handed to the client in `LOGIN_SUCCESS` / `RELOCATE_SUCCESS`.
    /// Regenerated at every login and every relocation.
    ReconnectKey
}

random_key! {
    /// One-time secret that lets a client claim its session on a relocation
    /// target. Bound to that target node.
    RelocationKey
}

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Session-level timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a connection stays open after a failure, redirect, or
    /// logout before the server closes it.
    #[serde(with = "millis")]
    pub disconnect_delay: Duration,

    /// How long a client has to reach the relocation target. Also the
    /// lifetime of a pending relocation on the target.
    #[serde(with = "millis")]
    pub relocation_timeout: Duration,
}

impl SessionConfig {
    pub const DEFAULT_DISCONNECT_DELAY: Duration = Duration::from_millis(1000);
    pub const DEFAULT_RELOCATION_TIMEOUT: Duration = Duration::from_secs(10);

    /// Replaces zero timeouts with the defaults.
    pub fn validated(self) -> Self {
        let pick = |value: Duration, default: Duration| {
            if value.is_zero() { default } else { value }
        };
        Self {
            disconnect_delay: pick(self.disconnect_delay, Self::DEFAULT_DISCONNECT_DELAY),
            relocation_timeout: pick(self.relocation_timeout, Self::DEFAULT_RELOCATION_TIMEOUT),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disconnect_delay: Self::DEFAULT_DISCONNECT_DELAY,
            relocation_timeout: Self::DEFAULT_RELOCATION_TIMEOUT,
        }
    }
}

/// Durations travel as integer milliseconds in configuration files.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
