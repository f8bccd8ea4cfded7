//! A framed view of a transport connection.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use hearth_transport::{Connection, ConnectionId, TransportError};
use tokio::sync::Mutex;

use crate::frame::{FrameDecoder, encode_frame};
use crate::opcode::PREFIX_LENGTH;
use crate::ProtocolError;

/// Wraps a [`Connection`] so callers read and write whole message bodies.
///
/// Only one [`read`](Self::read) may be outstanding at a time; a second
/// concurrent call fails with [`ProtocolError::ReadPending`] and leaves the
/// first untouched. Writes are not serialized here; the connection engine
/// funnels them through a single writer task.
pub struct MessageChannel<C> {
    conn: C,
    decoder: Mutex<FrameDecoder>,
    reading: AtomicBool,
}

/// Clears the read-pending flag when a read finishes or is cancelled.
struct ReadGuard<'a>(&'a AtomicBool);

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<C> MessageChannel<C>
where
    C: Connection<Error = TransportError>,
{
    /// Wraps `conn`, sizing the reassembly buffer to `read_buffer_size`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::ReadBufferTooSmall`] if `read_buffer_size`
    /// cannot hold a length prefix.
    pub fn new(conn: C, read_buffer_size: usize) -> Result<Self, ProtocolError> {
        if read_buffer_size < PREFIX_LENGTH {
            return Err(ProtocolError::ReadBufferTooSmall {
                size: read_buffer_size,
                min: PREFIX_LENGTH,
            });
        }
        Ok(Self {
            conn,
            decoder: Mutex::new(FrameDecoder::with_capacity(read_buffer_size)),
            reading: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Returns the next complete message body, or `None` once the peer has
    /// closed the connection.
    ///
    /// # Errors
    /// - [`ProtocolError::ReadPending`] if another read is in progress
    /// - [`ProtocolError::EmptyFrame`] for a zero-length frame
    /// - [`ProtocolError::Transport`] if the connection fails
    pub async fn read(&self) -> Result<Option<Bytes>, ProtocolError> {
        if self.reading.swap(true, Ordering::AcqRel) {
            return Err(ProtocolError::ReadPending);
        }
        let _guard = ReadGuard(&self.reading);
        let mut decoder = self.decoder.lock().await;
        loop {
            if let Some(body) = decoder.next_frame()? {
                return Ok(Some(body));
            }
            match self.conn.recv().await? {
                Some(chunk) => decoder.extend(&chunk),
                None => {
                    if decoder.buffered() > 0 {
                        tracing::debug!(
                            conn_id = %self.conn.id(),
                            buffered = decoder.buffered(),
                            "peer closed mid-frame"
                        );
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Frames `body` and writes it.
    pub async fn write(&self, body: &[u8]) -> Result<(), ProtocolError> {
        let frame = encode_frame(body)?;
        self.write_frame(&frame).await
    }

    /// Writes an already framed message.
    pub async fn write_frame(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        self.conn.send(frame).await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<(), ProtocolError> {
        self.conn.close().await?;
        Ok(())
    }
}
