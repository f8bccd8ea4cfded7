//! Wire protocol for Hearth.
//!
//! This crate defines the language clients and servers speak:
//!
//! - **Frames** ([`FrameDecoder`], [`encode_frame`]): `[u16 length][body]`
//!   reassembly over arbitrary network chunking.
//! - **Messages** ([`ClientMessage`], [`ServerMessage`], [`OpCode`]): the
//!   opcode-tagged bodies and their payload layouts.
//! - **Channel** ([`MessageChannel`]): a connection that reads and writes
//!   whole bodies, one read at a time.
//! - **Codec** ([`Codec`], [`JsonCodec`]): serde payloads for node-to-node
//!   RPC.
//!
//! ```text
//! Transport (chunks) -> FrameDecoder (bodies) -> ClientMessage -> engine
//! ```

mod channel;
mod codec;
mod error;
mod frame;
mod message;
mod opcode;
mod types;
pub mod wire;

pub use channel::MessageChannel;
pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use frame::{FrameDecoder, encode_frame};
pub use message::{ClientMessage, ServerMessage};
pub use opcode::{
    KEY_LENGTH, MAX_APPLICATION_PAYLOAD, MAX_MESSAGE_LENGTH, MAX_PAYLOAD_LENGTH, OpCode,
    PREFIX_LENGTH, PROTOCOL_VERSION,
};
pub use types::{ChannelId, ConnectInfo, Delivery, ProtocolDescriptor, TransportKind};
