//! Suspend, resume, and the client side of relocation.
//!
//! ```text
//! suspend() / relocate() ──SUSPEND_MESSAGES──→ client
//!                        ←─SUSPEND_MESSAGES_COMPLETE──
//!     relocating?  ──RELOCATE_NOTIFICATION(target, key)──→ client ──→ watchdog armed
//!     otherwise    ──resume()──RESUME_MESSAGES──→ client
//! ```
//!
//! While a suspend or relocation is active the engine refuses outbound
//! application messages; the session handle holds them instead.

use std::sync::Arc;

use bytes::Bytes;
use hearth_protocol::{ProtocolDescriptor, ServerMessage};
use hearth_session::RelocationKey;
use tokio::sync::oneshot;

use super::{RelocationInfo, SessionProtocol, SuspendState};
use crate::{EngineError, HearthError};

/// Resolves when the client acknowledges `SUSPEND_MESSAGES`.
#[derive(Debug)]
pub struct SuspendCompletion {
    rx: oneshot::Receiver<()>,
}

impl SuspendCompletion {
    /// # Errors
    /// Returns [`EngineError::Closed`] if the connection closed, or the
    /// suspend was cancelled by `resume`, before the client acknowledged.
    pub async fn wait(self) -> Result<(), EngineError> {
        self.rx.await.map_err(|_| EngineError::Closed)
    }
}

impl SessionProtocol {
    pub fn is_suspended(&self) -> bool {
        self.lock().suspend.is_some()
    }

    pub fn is_relocating(&self) -> bool {
        self.lock().relocation.is_some()
    }

    /// Asks the client to stop expecting messages.
    ///
    /// # Errors
    /// - [`EngineError::AlreadySuspending`] if a suspend is active
    /// - [`EngineError::Closed`] if the connection is closed
    pub fn suspend(&self) -> Result<SuspendCompletion, HearthError> {
        let frame = ServerMessage::SuspendMessages.frame()?;
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::Closed.into());
        }
        if state.suspend.is_some() {
            return Err(EngineError::AlreadySuspending.into());
        }
        let (tx, rx) = oneshot::channel();
        self.push(&mut state, frame)?;
        state.suspend = Some(SuspendState {
            completed: false,
            waiter: Some(tx),
        });
        tracing::debug!(conn_id = %self.conn_id, "suspending messages");
        Ok(SuspendCompletion { rx })
    }

    /// Ends a suspend that is not part of a relocation. Resuming when not
    /// suspended does nothing.
    ///
    /// # Errors
    /// - [`EngineError::Relocating`] while a relocation is pending
    pub fn resume(&self) -> Result<(), HearthError> {
        let frame = ServerMessage::ResumeMessages.frame()?;
        let mut state = self.lock();
        if state.relocation.is_some() {
            return Err(EngineError::Relocating.into());
        }
        if state.closed || state.suspend.take().is_none() {
            return Ok(());
        }
        self.push(&mut state, frame)?;
        tracing::debug!(conn_id = %self.conn_id, "resuming messages");
        Ok(())
    }

    /// Starts moving the client to the node described by `descriptors`.
    /// Messages are suspended first; the client learns the target once it
    /// acknowledges the suspend.
    ///
    /// # Errors
    /// - [`EngineError::AlreadyRelocating`] if a relocation or suspend is
    ///   active; nothing changes
    /// - [`EngineError::Closed`] if the connection is closed
    pub fn relocate(
        &self,
        descriptors: Vec<ProtocolDescriptor>,
        key: RelocationKey,
    ) -> Result<(), HearthError> {
        let frame = ServerMessage::SuspendMessages.frame()?;
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::Closed.into());
        }
        if state.relocation.is_some() || state.suspend.is_some() {
            return Err(EngineError::AlreadyRelocating.into());
        }
        self.push(&mut state, frame)?;
        state.suspend = Some(SuspendState {
            completed: false,
            waiter: None,
        });
        state.relocation = Some(RelocationInfo { descriptors, key });
        tracing::debug!(conn_id = %self.conn_id, %key, "relocation started");
        Ok(())
    }

    /// Handles `SUSPEND_MESSAGES_COMPLETE` from the client.
    pub(crate) fn suspend_acknowledged(self: &Arc<Self>) {
        let mut state = self.lock();
        let Some(suspend) = state.suspend.as_mut() else {
            tracing::warn!(conn_id = %self.conn_id, "suspend completion without a suspend");
            return;
        };
        if suspend.completed {
            tracing::warn!(conn_id = %self.conn_id, "duplicate suspend completion");
            return;
        }
        suspend.completed = true;
        if let Some(waiter) = suspend.waiter.take() {
            let _ = waiter.send(());
        }

        let Some(relocation) = state.relocation.as_ref() else {
            tracing::debug!(conn_id = %self.conn_id, "messages suspended");
            return;
        };
        let key = relocation.key;
        let target = self
            .settings
            .local
            .first_supported(&relocation.descriptors)
            .map(ProtocolDescriptor::connect_info);
        let Some(target) = target else {
            drop(state);
            tracing::error!(conn_id = %self.conn_id, "relocation target has no compatible protocol");
            self.close();
            return;
        };
        let message = ServerMessage::RelocateNotification {
            target,
            key: Bytes::copy_from_slice(key.as_bytes()),
        };
        let sent = match message.frame() {
            Ok(frame) => self.push(&mut state, frame).is_ok(),
            Err(e) => {
                tracing::error!(conn_id = %self.conn_id, error = %e, "cannot encode relocation notification");
                false
            }
        };
        drop(state);
        if sent {
            tracing::debug!(conn_id = %self.conn_id, "relocation notification sent");
            self.monitor_disconnection(self.settings.relocation_timeout);
        } else {
            self.close();
        }
    }
}
