//! Typed protocol messages.
//!
//! [`ClientMessage`] is everything a client may send, [`ServerMessage`] is
//! everything a server may send. Both encode to and decode from a message
//! body (opcode byte + payload); [`frame`](ServerMessage::frame) adds the
//! length prefix.

use bytes::Bytes;

use crate::frame::encode_frame;
use crate::opcode::{MAX_APPLICATION_PAYLOAD, OpCode};
use crate::types::{ChannelId, ConnectInfo};
use crate::wire::{WireReader, WireWriter, string_size};
use crate::ProtocolError;

fn check_payload(payload: &Bytes) -> Result<(), ProtocolError> {
    if payload.len() > MAX_APPLICATION_PAYLOAD {
        return Err(ProtocolError::MessageTooLong {
            len: payload.len(),
            max: MAX_APPLICATION_PAYLOAD,
        });
    }
    Ok(())
}

fn read_opcode(reader: &mut WireReader) -> Result<OpCode, ProtocolError> {
    if reader.remaining() == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    OpCode::try_from(reader.get_u8("opcode")?)
}

fn read_channel_id(bytes: Bytes) -> Result<ChannelId, ProtocolError> {
    ChannelId::from_wire_bytes(&bytes)
}

// ---------------------------------------------------------------------------
// ClientMessage
// ---------------------------------------------------------------------------

/// A message sent from a client to a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    LoginRequest {
        version: u8,
        name: String,
        password: String,
    },
    RelocateRequest {
        version: u8,
        key: Bytes,
    },
    SessionMessage {
        payload: Bytes,
    },
    ChannelMessage {
        channel: ChannelId,
        payload: Bytes,
    },
    LogoutRequest,
    SuspendMessagesComplete,
}

impl ClientMessage {
    pub fn opcode(&self) -> OpCode {
        match self {
            Self::LoginRequest { .. } => OpCode::LoginRequest,
            Self::RelocateRequest { .. } => OpCode::RelocateRequest,
            Self::SessionMessage { .. } => OpCode::SessionMessage,
            Self::ChannelMessage { .. } => OpCode::ChannelMessage,
            Self::LogoutRequest => OpCode::LogoutRequest,
            Self::SuspendMessagesComplete => OpCode::SuspendMessagesComplete,
        }
    }

    /// Encodes the message body (opcode + payload).
    ///
    /// # Errors
    /// Returns [`ProtocolError::MessageTooLong`] for oversized payloads or
    /// strings.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut w = WireWriter::default();
        w.put_u8(self.opcode().into());
        match self {
            Self::LoginRequest {
                version,
                name,
                password,
            } => {
                w.put_u8(*version);
                w.put_string(name)?.put_string(password)?;
            }
            Self::RelocateRequest { version, key } => {
                w.put_u8(*version).put_bytes(key);
            }
            Self::SessionMessage { payload } => {
                check_payload(payload)?;
                w.put_bytes(payload);
            }
            Self::ChannelMessage { channel, payload } => {
                check_payload(payload)?;
                let id = channel.to_wire_bytes();
                w.put_u16(id.len() as u16).put_bytes(&id).put_bytes(payload);
            }
            Self::LogoutRequest | Self::SuspendMessagesComplete => {}
        }
        Ok(w.freeze())
    }

    /// Encodes the message as a complete length-prefixed frame.
    pub fn frame(&self) -> Result<Bytes, ProtocolError> {
        encode_frame(&self.encode()?)
    }

    /// Decodes a message body received by a server.
    ///
    /// # Errors
    /// - [`ProtocolError::UnknownOpcode`] for unassigned opcode bytes
    /// - [`ProtocolError::InvalidMessage`] for server-to-client opcodes,
    ///   malformed channel ids, and trailing bytes
    /// - [`ProtocolError::Truncated`] if a field is cut short
    pub fn decode(body: Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(body);
        let op = read_opcode(&mut r)?;
        let msg = match op {
            OpCode::LoginRequest => {
                let version = r.get_u8("version")?;
                let name = r.get_string("name")?;
                let password = r.get_string("password")?;
                Self::LoginRequest {
                    version,
                    name,
                    password,
                }
            }
            OpCode::RelocateRequest => {
                let version = r.get_u8("version")?;
                Self::RelocateRequest {
                    version,
                    key: r.rest(),
                }
            }
            OpCode::SessionMessage => Self::SessionMessage { payload: r.rest() },
            OpCode::ChannelMessage => {
                let len = r.get_u16("channel id length")? as usize;
                let channel = read_channel_id(r.get_bytes("channel id", len)?)?;
                Self::ChannelMessage {
                    channel,
                    payload: r.rest(),
                }
            }
            OpCode::LogoutRequest => Self::LogoutRequest,
            OpCode::SuspendMessagesComplete => Self::SuspendMessagesComplete,
            other => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "{other} is not sent by clients"
                )));
            }
        };
        r.finish()?;
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// ServerMessage
// ---------------------------------------------------------------------------

/// A message sent from a server to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    LoginSuccess { reconnect_key: Bytes },
    LoginFailure { reason: String },
    LoginRedirect { target: ConnectInfo },
    RelocateNotification { target: ConnectInfo, key: Bytes },
    RelocateSuccess { reconnect_key: Bytes },
    RelocateFailure { reason: String },
    SuspendMessages,
    ResumeMessages,
    SessionMessage { payload: Bytes },
    LogoutSuccess,
    ChannelJoin { name: String, channel: ChannelId },
    ChannelLeave { channel: ChannelId },
    ChannelMessage { channel: ChannelId, payload: Bytes },
}

impl ServerMessage {
    pub fn opcode(&self) -> OpCode {
        match self {
            Self::LoginSuccess { .. } => OpCode::LoginSuccess,
            Self::LoginFailure { .. } => OpCode::LoginFailure,
            Self::LoginRedirect { .. } => OpCode::LoginRedirect,
            Self::RelocateNotification { .. } => OpCode::RelocateNotification,
            Self::RelocateSuccess { .. } => OpCode::RelocateSuccess,
            Self::RelocateFailure { .. } => OpCode::RelocateFailure,
            Self::SuspendMessages => OpCode::SuspendMessages,
            Self::ResumeMessages => OpCode::ResumeMessages,
            Self::SessionMessage { .. } => OpCode::SessionMessage,
            Self::LogoutSuccess => OpCode::LogoutSuccess,
            Self::ChannelJoin { .. } => OpCode::ChannelJoin,
            Self::ChannelLeave { .. } => OpCode::ChannelLeave,
            Self::ChannelMessage { .. } => OpCode::ChannelMessage,
        }
    }

    /// Encoded body size, used to presize the buffer.
    fn size_hint(&self) -> usize {
        1 + match self {
            Self::LoginSuccess { reconnect_key } | Self::RelocateSuccess { reconnect_key } => {
                reconnect_key.len()
            }
            Self::LoginFailure { reason } | Self::RelocateFailure { reason } => {
                string_size(reason)
            }
            Self::LoginRedirect { target } => target.encoded_len(),
            Self::RelocateNotification { target, key } => target.encoded_len() + key.len(),
            Self::SessionMessage { payload } => payload.len(),
            Self::ChannelJoin { name, .. } => string_size(name) + ChannelId::MAX_WIRE_LENGTH,
            Self::ChannelLeave { .. } => ChannelId::MAX_WIRE_LENGTH,
            Self::ChannelMessage { payload, .. } => 2 + ChannelId::MAX_WIRE_LENGTH + payload.len(),
            Self::SuspendMessages | Self::ResumeMessages | Self::LogoutSuccess => 0,
        }
    }

    /// Encodes the message body (opcode + payload).
    ///
    /// # Errors
    /// Returns [`ProtocolError::MessageTooLong`] if an application payload
    /// exceeds [`MAX_APPLICATION_PAYLOAD`] or a string does not fit its
    /// length prefix.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut w = WireWriter::with_capacity(self.size_hint());
        w.put_u8(self.opcode().into());
        match self {
            Self::LoginSuccess { reconnect_key } | Self::RelocateSuccess { reconnect_key } => {
                w.put_bytes(reconnect_key);
            }
            Self::LoginFailure { reason } | Self::RelocateFailure { reason } => {
                w.put_string(reason)?;
            }
            Self::LoginRedirect { target } => target.write(&mut w)?,
            Self::RelocateNotification { target, key } => {
                target.write(&mut w)?;
                w.put_bytes(key);
            }
            Self::SessionMessage { payload } => {
                check_payload(payload)?;
                w.put_bytes(payload);
            }
            Self::ChannelJoin { name, channel } => {
                w.put_string(name)?.put_bytes(&channel.to_wire_bytes());
            }
            Self::ChannelLeave { channel } => {
                w.put_bytes(&channel.to_wire_bytes());
            }
            Self::ChannelMessage { channel, payload } => {
                check_payload(payload)?;
                let id = channel.to_wire_bytes();
                w.put_u16(id.len() as u16).put_bytes(&id).put_bytes(payload);
            }
            Self::SuspendMessages | Self::ResumeMessages | Self::LogoutSuccess => {}
        }
        Ok(w.freeze())
    }

    /// Encodes the message as a complete length-prefixed frame.
    pub fn frame(&self) -> Result<Bytes, ProtocolError> {
        encode_frame(&self.encode()?)
    }

    /// Decodes a message body received by a client.
    pub fn decode(body: Bytes) -> Result<Self, ProtocolError> {
        let mut r = WireReader::new(body);
        let op = read_opcode(&mut r)?;
        let msg = match op {
            OpCode::LoginSuccess => Self::LoginSuccess {
                reconnect_key: r.rest(),
            },
            OpCode::RelocateSuccess => Self::RelocateSuccess {
                reconnect_key: r.rest(),
            },
            OpCode::LoginFailure => Self::LoginFailure {
                reason: r.get_string("reason")?,
            },
            OpCode::RelocateFailure => Self::RelocateFailure {
                reason: r.get_string("reason")?,
            },
            OpCode::LoginRedirect => Self::LoginRedirect {
                target: ConnectInfo::read(&mut r)?,
            },
            OpCode::RelocateNotification => {
                let target = ConnectInfo::read(&mut r)?;
                Self::RelocateNotification {
                    target,
                    key: r.rest(),
                }
            }
            OpCode::SuspendMessages => Self::SuspendMessages,
            OpCode::ResumeMessages => Self::ResumeMessages,
            OpCode::SessionMessage => Self::SessionMessage { payload: r.rest() },
            OpCode::LogoutSuccess => Self::LogoutSuccess,
            OpCode::ChannelJoin => {
                let name = r.get_string("channel name")?;
                Self::ChannelJoin {
                    name,
                    channel: read_channel_id(r.rest())?,
                }
            }
            OpCode::ChannelLeave => Self::ChannelLeave {
                channel: read_channel_id(r.rest())?,
            },
            OpCode::ChannelMessage => {
                let len = r.get_u16("channel id length")? as usize;
                let channel = read_channel_id(r.get_bytes("channel id", len)?)?;
                Self::ChannelMessage {
                    channel,
                    payload: r.rest(),
                }
            }
            other => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "{other} is not sent by servers"
                )));
            }
        };
        r.finish()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::PROTOCOL_VERSION;

    #[test]
    fn test_login_request_layout() {
        let msg = ClientMessage::LoginRequest {
            version: PROTOCOL_VERSION,
            name: "bob".into(),
            password: "pw".into(),
        };
        let body = msg.encode().expect("encode");
        assert_eq!(body.as_ref(), b"\x10\x01\x00\x03bob\x00\x02pw");
        assert_eq!(ClientMessage::decode(body).expect("decode"), msg);
    }

    #[test]
    fn test_channel_message_layout_has_id_length() {
        let msg = ServerMessage::ChannelMessage {
            channel: ChannelId(0x0102),
            payload: Bytes::from_static(b"hi"),
        };
        let body = msg.encode().expect("encode");
        assert_eq!(body.as_ref(), b"\x52\x00\x02\x01\x02hi");
    }

    #[test]
    fn test_channel_join_id_is_trailing_bytes() {
        let msg = ServerMessage::ChannelJoin {
            name: "lobby".into(),
            channel: ChannelId(7),
        };
        let body = msg.encode().expect("encode");
        assert_eq!(body.as_ref(), b"\x50\x00\x05lobby\x07");
        assert_eq!(ServerMessage::decode(body).expect("decode"), msg);
    }

    #[test]
    fn test_relocate_notification_carries_target_then_key() {
        let msg = ServerMessage::RelocateNotification {
            target: ConnectInfo {
                host: "n2".into(),
                port: 9000,
            },
            key: Bytes::from(vec![0xab; 16]),
        };
        let body = msg.encode().expect("encode");
        assert_eq!(&body[..7], b"\x14\x00\x02n2\x23\x28");
        assert_eq!(body.len(), 7 + 16);
        assert_eq!(ServerMessage::decode(body).expect("decode"), msg);
    }

    #[test]
    fn test_oversized_session_payload_rejected() {
        let payload = Bytes::from(vec![0u8; MAX_APPLICATION_PAYLOAD + 1]);
        let err = ServerMessage::SessionMessage { payload }.encode().unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLong { .. }));
    }

    #[test]
    fn test_max_session_payload_frames() {
        let payload = Bytes::from(vec![0u8; MAX_APPLICATION_PAYLOAD]);
        let frame = ServerMessage::SessionMessage { payload }.frame().expect("fits");
        assert_eq!(frame.len(), 2 + 1 + MAX_APPLICATION_PAYLOAD);
    }

    #[test]
    fn test_client_decode_rejects_server_opcode() {
        let body = Bytes::from_static(b"\x11abc");
        assert!(matches!(
            ClientMessage::decode(body),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_client_decode_rejects_unknown_opcode() {
        assert!(matches!(
            ClientMessage::decode(Bytes::from_static(b"\x99")),
            Err(ProtocolError::UnknownOpcode(0x99))
        ));
    }

    #[test]
    fn test_logout_with_payload_rejected() {
        assert!(ClientMessage::decode(Bytes::from_static(b"\x40\x00")).is_err());
    }

    #[test]
    fn test_failure_reason_decodes() {
        let body = ServerMessage::LoginFailure {
            reason: "login refused".into(),
        }
        .encode()
        .expect("encode");
        match ServerMessage::decode(body).expect("decode") {
            ServerMessage::LoginFailure { reason } => assert_eq!(reason, "login refused"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
