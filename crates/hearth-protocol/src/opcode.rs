//! Opcode catalogue and protocol constants.
//!
//! Opcode byte values are part of the wire format and never change between
//! protocol versions; new opcodes only ever take unused values.

use std::fmt;

use crate::ProtocolError;

/// Protocol version carried in `LOGIN_REQUEST` and `RELOCATE_REQUEST`.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Width of the big-endian length prefix, in bytes.
pub const PREFIX_LENGTH: usize = 2;

/// Largest message body (opcode + payload) the length prefix can describe.
pub const MAX_MESSAGE_LENGTH: usize = 65535;

/// Largest message body the write path accepts.
pub const MAX_PAYLOAD_LENGTH: usize = 65532;

/// Largest application payload in a session or channel message: room is
/// reserved for the opcode, the channel-id length, and an 8-byte channel id.
pub const MAX_APPLICATION_PAYLOAD: usize = MAX_MESSAGE_LENGTH - 1 - 2 - 8;

/// Length of reconnect and relocation keys minted by the server.
pub const KEY_LENGTH: usize = 16;

/// The first byte of every message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    LoginRequest = 0x10,
    LoginSuccess = 0x11,
    LoginFailure = 0x12,
    LoginRedirect = 0x13,
    RelocateNotification = 0x14,
    RelocateRequest = 0x15,
    RelocateSuccess = 0x16,
    RelocateFailure = 0x17,
    SuspendMessages = 0x18,
    SuspendMessagesComplete = 0x19,
    ResumeMessages = 0x1a,
    SessionMessage = 0x30,
    LogoutRequest = 0x40,
    LogoutSuccess = 0x41,
    ChannelJoin = 0x50,
    ChannelLeave = 0x51,
    ChannelMessage = 0x52,
}

impl OpCode {
    /// Returns `true` for opcodes a client may legitimately send to a server.
    pub fn is_client_originated(self) -> bool {
        matches!(
            self,
            Self::LoginRequest
                | Self::RelocateRequest
                | Self::SessionMessage
                | Self::ChannelMessage
                | Self::LogoutRequest
                | Self::SuspendMessagesComplete
        )
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x10 => Self::LoginRequest,
            0x11 => Self::LoginSuccess,
            0x12 => Self::LoginFailure,
            0x13 => Self::LoginRedirect,
            0x14 => Self::RelocateNotification,
            0x15 => Self::RelocateRequest,
            0x16 => Self::RelocateSuccess,
            0x17 => Self::RelocateFailure,
            0x18 => Self::SuspendMessages,
            0x19 => Self::SuspendMessagesComplete,
            0x1a => Self::ResumeMessages,
            0x30 => Self::SessionMessage,
            0x40 => Self::LogoutRequest,
            0x41 => Self::LogoutSuccess,
            0x50 => Self::ChannelJoin,
            0x51 => Self::ChannelLeave,
            0x52 => Self::ChannelMessage,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoginRequest => "LOGIN_REQUEST",
            Self::LoginSuccess => "LOGIN_SUCCESS",
            Self::LoginFailure => "LOGIN_FAILURE",
            Self::LoginRedirect => "LOGIN_REDIRECT",
            Self::RelocateNotification => "RELOCATE_NOTIFICATION",
            Self::RelocateRequest => "RELOCATE_REQUEST",
            Self::RelocateSuccess => "RELOCATE_SUCCESS",
            Self::RelocateFailure => "RELOCATE_FAILURE",
            Self::SuspendMessages => "SUSPEND_MESSAGES",
            Self::SuspendMessagesComplete => "SUSPEND_MESSAGES_COMPLETE",
            Self::ResumeMessages => "RESUME_MESSAGES",
            Self::SessionMessage => "SESSION_MESSAGE",
            Self::LogoutRequest => "LOGOUT_REQUEST",
            Self::LogoutSuccess => "LOGOUT_SUCCESS",
            Self::ChannelJoin => "CHANNEL_JOIN",
            Self::ChannelLeave => "CHANNEL_LEAVE",
            Self::ChannelMessage => "CHANNEL_MESSAGE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OpCode; 17] = [
        OpCode::LoginRequest,
        OpCode::LoginSuccess,
        OpCode::LoginFailure,
        OpCode::LoginRedirect,
        OpCode::RelocateNotification,
        OpCode::RelocateRequest,
        OpCode::RelocateSuccess,
        OpCode::RelocateFailure,
        OpCode::SuspendMessages,
        OpCode::SuspendMessagesComplete,
        OpCode::ResumeMessages,
        OpCode::SessionMessage,
        OpCode::LogoutRequest,
        OpCode::LogoutSuccess,
        OpCode::ChannelJoin,
        OpCode::ChannelLeave,
        OpCode::ChannelMessage,
    ];

    #[test]
    fn test_every_opcode_maps_back_from_its_byte() {
        for op in ALL {
            assert_eq!(OpCode::try_from(u8::from(op)).expect("known"), op);
        }
    }

    #[test]
    fn test_unassigned_byte_is_unknown() {
        assert!(matches!(
            OpCode::try_from(0x00),
            Err(ProtocolError::UnknownOpcode(0x00))
        ));
        assert!(matches!(
            OpCode::try_from(0xff),
            Err(ProtocolError::UnknownOpcode(0xff))
        ));
    }

    #[test]
    fn test_client_originated_set() {
        let client: Vec<_> = ALL.iter().filter(|op| op.is_client_originated()).collect();
        assert_eq!(client.len(), 6);
        assert!(!OpCode::LoginSuccess.is_client_originated());
        assert!(!OpCode::ChannelJoin.is_client_originated());
        assert!(OpCode::SuspendMessagesComplete.is_client_originated());
    }

    #[test]
    fn test_max_application_payload_value() {
        assert_eq!(MAX_APPLICATION_PAYLOAD, 65524);
    }
}
