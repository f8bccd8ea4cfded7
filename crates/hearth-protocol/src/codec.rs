//! Serialization for inter-node RPC payloads.
//!
//! The client protocol is a fixed binary layout (see [`crate::message`]).
//! Node-to-node traffic is not latency critical and evolves faster, so it is
//! carried as serde values through a [`Codec`]. Only [`JsonCodec`] exists
//! today; the RPC layer is generic over the trait so a binary codec can be
//! dropped in later.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Converts serde values to bytes and back.
///
/// `Send + Sync + 'static` because one codec instance is shared by every RPC
/// connection task of a node.
pub trait Codec: Send + Sync + 'static {
    /// # Errors
    /// Returns `ProtocolError::Encode` if `value` cannot be represented.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// # Errors
    /// Returns `ProtocolError::Decode` if `data` is malformed or does not
    /// match `T`.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

/// A [`Codec`] backed by `serde_json`. Behind the `json` feature (on by
/// default).
///
/// ```rust
/// use hearth_protocol::{Codec, Delivery, JsonCodec};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&Delivery::Reliable).unwrap();
/// assert_eq!(bytes, b"\"reliable\"");
/// let back: Delivery = codec.decode(&bytes).unwrap();
/// assert_eq!(back, Delivery::Reliable);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;
    use crate::{ChannelId, ProtocolDescriptor};

    #[test]
    fn test_json_codec_descriptor() {
        let codec = JsonCodec;
        let d = ProtocolDescriptor::tcp("10.0.0.2", 7000);
        let bytes = codec.encode(&d).expect("encode");
        let text = String::from_utf8(bytes.clone()).expect("utf8");
        assert!(text.contains("\"transport\":\"tcp\""));
        let back: ProtocolDescriptor = codec.decode(&bytes).expect("decode");
        assert_eq!(back, d);
    }

    #[test]
    fn test_json_codec_channel_id_is_transparent() {
        let bytes = JsonCodec.encode(&ChannelId(42)).expect("encode");
        assert_eq!(bytes, b"42");
    }

    #[test]
    fn test_json_codec_decode_garbage_fails() {
        let result: Result<ProtocolDescriptor, _> = JsonCodec.decode(b"{not json");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }
}
