//! Byte-stream transport: plain TCP, or any `AsyncRead + AsyncWrite` stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::{Connection, ConnectionId, Transport, TransportError};

/// Default size of the buffer each `recv` reads into.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 128 * 1024;

/// A TCP [`Transport`] that listens for incoming client connections.
pub struct TcpTransport {
    listener: TcpListener,
    read_buffer_size: usize,
}

impl TcpTransport {
    /// Binds a new TCP transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        Self::bind_with_buffer(addr, DEFAULT_READ_BUFFER_SIZE).await
    }

    /// Binds a new TCP transport whose connections read into buffers of
    /// `read_buffer_size` bytes.
    pub async fn bind_with_buffer(
        addr: &str,
        read_buffer_size: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            TransportError::BindFailed {
                addr: addr.to_string(),
                source,
            }
        })?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self {
            listener,
            read_buffer_size,
        })
    }
}

impl Transport for TcpTransport {
    type Connection = StreamConnection<TcpStream>;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, error = %e, "set_nodelay failed");
        }
        let conn = StreamConnection::with_buffer(stream, self.read_buffer_size);
        tracing::debug!(id = %conn.id(), %addr, "accepted TCP connection");
        Ok(conn)
    }

    fn local_addr(&self) -> Result<SocketAddr, Self::Error> {
        self.listener
            .local_addr()
            .map_err(TransportError::AcceptFailed)
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// A [`Connection`] over any bidirectional byte stream.
///
/// The stream is split so a read and a write can be outstanding at the same
/// time; each half sits behind its own lock.
pub struct StreamConnection<S> {
    id: ConnectionId,
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    read_buffer_size: usize,
    closed: AtomicBool,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps `stream` using the default read buffer size.
    pub fn new(stream: S) -> Self {
        Self::with_buffer(stream, DEFAULT_READ_BUFFER_SIZE)
    }

    /// Wraps `stream`, reading at most `read_buffer_size` bytes per `recv`.
    pub fn with_buffer(stream: S, read_buffer_size: usize) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id: ConnectionId::next(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            read_buffer_size: read_buffer_size.max(1),
            closed: AtomicBool::new(false),
        }
    }
}

impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(TransportError::SendFailed)?;
        writer.flush().await.map_err(TransportError::SendFailed)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.read_buffer_size];
        let n = self
            .reader
            .lock()
            .await
            .read(&mut buf)
            .await
            .map_err(TransportError::ReceiveFailed)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::trace!(id = %self.id, "closing stream connection");
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(TransportError::SendFailed)
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}
