//! The per-connection writer task.
//!
//! Owns the outbound half of the connection. Frames arrive over an
//! unbounded channel and are written one at a time, so write order is
//! enqueue order and only one write is ever in flight.

use std::sync::{Arc, Weak};

use hearth_protocol::MessageChannel;
use hearth_transport::{Connection, TransportError};
use tokio::sync::mpsc;

use super::{SessionProtocol, WriterCommand};

pub(super) async fn run_writer<C>(
    channel: Arc<MessageChannel<C>>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    protocol: Weak<SessionProtocol>,
) where
    C: Connection<Error = TransportError>,
{
    let conn_id = channel.id();
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Frame(frame) => {
                if let Err(e) = channel.write_frame(&frame).await {
                    tracing::debug!(%conn_id, error = %e, "write failed, dropping queued frames");
                    rx.close();
                    while rx.try_recv().is_ok() {}
                    if let Some(protocol) = protocol.upgrade() {
                        protocol.close();
                    }
                    break;
                }
                tracing::trace!(%conn_id, len = frame.len(), "frame written");
            }
            WriterCommand::Close => break,
        }
    }
    if let Err(e) = channel.close().await {
        tracing::trace!(%conn_id, error = %e, "close after writer exit");
    }
    tracing::trace!(%conn_id, "writer stopped");
}
