//! Frame codec: `[u16 big-endian length][body]`.
//!
//! The decoder is fed raw chunks exactly as the transport produced them and
//! only ever hands out complete bodies, so callers never see a partial
//! message no matter how the network split it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::opcode::{MAX_PAYLOAD_LENGTH, PREFIX_LENGTH};
use crate::ProtocolError;

/// Accumulates inbound bytes and splits them into message bodies.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a decoder whose buffer starts with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends a chunk received from the transport.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of buffered bytes that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete body, or `None` if more bytes are needed.
    ///
    /// # Errors
    /// Returns [`ProtocolError::EmptyFrame`] for a zero length prefix.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buf.len() < PREFIX_LENGTH {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if len == 0 {
            return Err(ProtocolError::EmptyFrame);
        }
        if self.buf.len() < PREFIX_LENGTH + len {
            self.buf.reserve(PREFIX_LENGTH + len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(PREFIX_LENGTH);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Prefixes `body` with its length.
///
/// # Errors
/// Returns [`ProtocolError::MessageTooLong`] if `body` exceeds
/// [`MAX_PAYLOAD_LENGTH`].
pub fn encode_frame(body: &[u8]) -> Result<Bytes, ProtocolError> {
    if body.len() > MAX_PAYLOAD_LENGTH {
        return Err(ProtocolError::MessageTooLong {
            len: body.len(),
            max: MAX_PAYLOAD_LENGTH,
        });
    }
    if body.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    let mut out = BytesMut::with_capacity(PREFIX_LENGTH + body.len());
    out.put_u16(body.len() as u16);
    out.put_slice(body);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_waits_for_complete_prefix() {
        let mut d = FrameDecoder::new();
        d.extend(&[0x00]);
        assert!(d.next_frame().expect("ok").is_none());
        d.extend(&[0x02, 0x30]);
        assert!(d.next_frame().expect("ok").is_none());
        d.extend(&[0xaa]);
        assert_eq!(d.next_frame().expect("ok").expect("frame").as_ref(), &[0x30, 0xaa]);
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn test_decoder_yields_back_to_back_frames_from_one_chunk() {
        let mut d = FrameDecoder::new();
        d.extend(&[0x00, 0x01, 0x40, 0x00, 0x02, 0x30, 0x01, 0x00]);
        assert_eq!(d.next_frame().expect("ok").expect("first").as_ref(), &[0x40]);
        assert_eq!(d.next_frame().expect("ok").expect("second").as_ref(), &[0x30, 0x01]);
        assert!(d.next_frame().expect("ok").is_none());
        assert_eq!(d.buffered(), 1);
    }

    #[test]
    fn test_decoder_handles_byte_at_a_time_delivery() {
        let frame = encode_frame(b"\x30hello").expect("encode");
        let mut d = FrameDecoder::new();
        let mut out = Vec::new();
        for b in frame.iter() {
            d.extend(&[*b]);
            if let Some(body) = d.next_frame().expect("ok") {
                out.push(body);
            }
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref(), b"\x30hello");
    }

    #[test]
    fn test_decoder_rejects_empty_frame() {
        let mut d = FrameDecoder::new();
        d.extend(&[0x00, 0x00]);
        assert!(matches!(d.next_frame(), Err(ProtocolError::EmptyFrame)));
    }

    #[test]
    fn test_encode_frame_rejects_oversized_body() {
        let body = vec![0u8; MAX_PAYLOAD_LENGTH + 1];
        assert!(matches!(
            encode_frame(&body),
            Err(ProtocolError::MessageTooLong { .. })
        ));
        let body = vec![0u8; MAX_PAYLOAD_LENGTH];
        assert_eq!(encode_frame(&body).expect("fits").len(), MAX_PAYLOAD_LENGTH + 2);
    }
}
