//! Primitive field readers and writers for message bodies.
//!
//! All integers are big-endian. Strings are a `u16` byte length followed by
//! UTF-8 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtocolError;

/// Reads fields from a message body, checking lengths as it goes.
#[derive(Debug)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, field: &'static str, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Truncated {
                field,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self, field: &'static str) -> Result<u16, ProtocolError> {
        self.ensure(field, 2)?;
        Ok(self.buf.get_u16())
    }

    /// Reads exactly `len` bytes without copying.
    pub fn get_bytes(&mut self, field: &'static str, len: usize) -> Result<Bytes, ProtocolError> {
        self.ensure(field, len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn get_string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let len = self.get_u16(field)? as usize;
        let raw = self.get_bytes(field, len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::InvalidMessage(format!("{field} is not valid UTF-8")))
    }

    /// Consumes everything that is left.
    pub fn rest(&mut self) -> Bytes {
        let len = self.buf.remaining();
        self.buf.split_to(len)
    }

    /// Fails if unread bytes remain.
    pub fn finish(self) -> Result<(), ProtocolError> {
        if self.buf.has_remaining() {
            return Err(ProtocolError::InvalidMessage(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

/// Appends fields to a message body.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    /// Appends a length-prefixed string.
    ///
    /// # Errors
    /// Returns [`ProtocolError::MessageTooLong`] if the string does not fit a
    /// `u16` length.
    pub fn put_string(&mut self, value: &str) -> Result<&mut Self, ProtocolError> {
        let len = u16::try_from(value.len()).map_err(|_| ProtocolError::MessageTooLong {
            len: value.len(),
            max: u16::MAX as usize,
        })?;
        self.buf.put_u16(len);
        self.buf.put_slice(value.as_bytes());
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Size of a string once encoded with [`WireWriter::put_string`].
pub fn string_size(value: &str) -> usize {
    2 + value.len()
}
