//! Value types that appear inside protocol messages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::wire::{WireReader, WireWriter};
use crate::ProtocolError;

// ---------------------------------------------------------------------------
// ChannelId
// ---------------------------------------------------------------------------

/// Identifier of an application channel (a named group of sessions).
///
/// On the wire a channel id is its minimal big-endian representation: at
/// least one byte, at most eight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl ChannelId {
    /// Longest wire encoding of a channel id.
    pub const MAX_WIRE_LENGTH: usize = 8;

    /// Minimal big-endian encoding.
    pub fn to_wire_bytes(self) -> Vec<u8> {
        let raw = self.0.to_be_bytes();
        let skip = raw.iter().take_while(|b| **b == 0).count().min(7);
        raw[skip..].to_vec()
    }

    /// Parses a wire encoding.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidMessage`] if `bytes` is empty or
    /// longer than eight bytes.
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.is_empty() || bytes.len() > Self::MAX_WIRE_LENGTH {
            return Err(ProtocolError::InvalidMessage(format!(
                "channel id must be 1..=8 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{:x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// The delivery guarantee requested for an outbound message.
///
/// The simple protocol only implements [`Delivery::Reliable`]; weaker
/// requirements are satisfied by reliable delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// May be lost, may arrive out of order.
    Unreliable,
    /// May be lost, never reordered.
    OrderedUnreliable,
    /// Never lost, may be reordered.
    UnorderedReliable,
    /// Never lost, never reordered. Like TCP.
    #[default]
    Reliable,
}

impl Delivery {
    /// Returns `true` if a transport offering `self` also satisfies `other`.
    pub fn satisfies(self, other: Delivery) -> bool {
        match self {
            Self::Reliable => true,
            Self::UnorderedReliable => {
                matches!(other, Self::UnorderedReliable | Self::Unreliable)
            }
            Self::OrderedUnreliable => {
                matches!(other, Self::OrderedUnreliable | Self::Unreliable)
            }
            Self::Unreliable => other == Self::Unreliable,
        }
    }
}

// ---------------------------------------------------------------------------
// ProtocolDescriptor
// ---------------------------------------------------------------------------

/// The transport a protocol acceptor listens with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Tcp,
    WebSocket,
}

/// Describes how a client reaches one protocol acceptor of a node.
///
/// Login redirects and relocation notifications carry the
/// [`ConnectInfo`] of the first descriptor of the target node that the local
/// acceptor [`supports`](Self::supports).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
}

impl ProtocolDescriptor {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: TransportKind::Tcp,
            host: host.into(),
            port,
        }
    }

    /// Returns `true` if a client speaking to `self` can also speak to
    /// `other`.
    pub fn supports(&self, other: &ProtocolDescriptor) -> bool {
        self.transport == other.transport
    }

    /// The address a client should (re)connect to for this descriptor.
    pub fn connect_info(&self) -> ConnectInfo {
        ConnectInfo {
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Returns the first descriptor in `candidates` that `self` supports.
    pub fn first_supported<'a>(
        &self,
        candidates: &'a [ProtocolDescriptor],
    ) -> Option<&'a ProtocolDescriptor> {
        candidates.iter().find(|d| self.supports(d))
    }
}

/// Where a client should connect next: host string, then `u16` port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub host: String,
    pub port: u16,
}

impl ConnectInfo {
    pub(crate) fn write(&self, w: &mut WireWriter) -> Result<(), ProtocolError> {
        w.put_string(&self.host)?.put_u16(self.port);
        Ok(())
    }

    pub(crate) fn read(r: &mut WireReader) -> Result<Self, ProtocolError> {
        let host = r.get_string("host")?;
        let port = r.get_u16("port")?;
        Ok(Self { host, port })
    }

    pub(crate) fn encoded_len(&self) -> usize {
        crate::wire::string_size(&self.host) + 2
    }
}

impl fmt::Display for ConnectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProtocolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}://{}:{}", self.transport, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_minimal_encoding() {
        assert_eq!(ChannelId(0).to_wire_bytes(), vec![0x00]);
        assert_eq!(ChannelId(0x2a).to_wire_bytes(), vec![0x2a]);
        assert_eq!(ChannelId(0x0102).to_wire_bytes(), vec![0x01, 0x02]);
        assert_eq!(ChannelId(u64::MAX).to_wire_bytes().len(), 8);
    }

    #[test]
    fn test_channel_id_from_wire_bytes() {
        assert_eq!(
            ChannelId::from_wire_bytes(&[0x01, 0x02]).expect("valid"),
            ChannelId(0x0102)
        );
        assert!(ChannelId::from_wire_bytes(&[]).is_err());
        assert!(ChannelId::from_wire_bytes(&[1; 9]).is_err());
    }

    #[test]
    fn test_reliable_satisfies_everything() {
        for d in [
            Delivery::Unreliable,
            Delivery::OrderedUnreliable,
            Delivery::UnorderedReliable,
            Delivery::Reliable,
        ] {
            assert!(Delivery::Reliable.satisfies(d));
        }
        assert!(!Delivery::Unreliable.satisfies(Delivery::Reliable));
        assert!(!Delivery::OrderedUnreliable.satisfies(Delivery::UnorderedReliable));
    }

    #[test]
    fn test_first_supported_skips_other_transports() {
        let local = ProtocolDescriptor::tcp("0.0.0.0", 1000);
        let candidates = vec![
            ProtocolDescriptor {
                transport: TransportKind::WebSocket,
                host: "ws.example".into(),
                port: 80,
            },
            ProtocolDescriptor::tcp("node2.example", 2000),
        ];
        let found = local.first_supported(&candidates).expect("tcp descriptor");
        assert_eq!(found.host, "node2.example");
        assert!(local.first_supported(&candidates[..1]).is_none());
    }

    #[test]
    fn test_connect_info_layout() {
        let info = ProtocolDescriptor::tcp("h", 0x1234).connect_info();
        let mut w = WireWriter::default();
        info.write(&mut w).expect("fits");
        assert_eq!(info.encoded_len(), 5);
        let bytes = w.freeze();
        assert_eq!(bytes.as_ref(), b"\x00\x01h\x12\x34");
        let mut r = WireReader::new(bytes);
        assert_eq!(ConnectInfo::read(&mut r).expect("decode"), info);
    }
}
