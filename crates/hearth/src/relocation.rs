//! Relocation coordinator: moving a session's client between nodes.
//!
//! ```text
//!  source node                        target node                    client
//!  ───────────                        ───────────                    ──────
//!  relocate(session, target)
//!    ──prepare_relocation(key)──────→ reserve key
//!    handle: Relocating
//!    ──SUSPEND_MESSAGES───────────────────────────────────────────→
//!    ←─────────────────────────────────────────SUSPEND_MESSAGES_COMPLETE
//!    ──RELOCATE_NOTIFICATION(target, key)─────────────────────────→
//!                                     ←──────────────RELOCATE_REQUEST(key)
//!                                     take key, handle: Arriving
//!    ←─complete_relocation(key)──────
//!    held messages ─────────────────→ activate
//!    close old connection quietly     ──RELOCATE_SUCCESS, held messages──→
//! ```
//!
//! If the client never shows up at the target, the source's watchdog
//! abandons the session after the relocation timeout. After a successful
//! move the source keeps a route to the target for the same timeout, so
//! peers that still route to the source reach the session.

use std::sync::Arc;

use hearth_delivery::OutboundMessage;
use hearth_session::{
    Identity, NodeId, PendingRelocation, ReconnectKey, RelocationKey, SessionError, SessionId,
};

use crate::engine::{LoginGrant, SessionProtocol};
use crate::handle::SessionHandle;
use crate::service::NodeCore;
use crate::{HearthError, LoginError};

impl NodeCore {
    /// Source side: moves `session` to `target`.
    pub(crate) async fn relocate(
        self: &Arc<Self>,
        session: SessionId,
        target: NodeId,
    ) -> Result<(), HearthError> {
        if target == self.node_id {
            return Err(HearthError::AlreadyLocal(session, target));
        }
        let handle = self
            .handle(&session)
            .ok_or(HearthError::UnknownSession(session))?;
        let descriptors = self
            .cluster
            .descriptors(target)
            .ok_or(HearthError::UnknownNode(target))?;

        handle.claim_relocation()?;

        let key = RelocationKey::random();
        let prepared = self
            .forwarder
            .prepare_relocation(target, key, session, handle.identity().clone(), self.node_id)
            .await;
        if let Err(e) = prepared {
            handle.release_claim();
            return Err(e.into());
        }
        if let Err(e) = handle.begin_relocation(target, descriptors, key) {
            match self.forwarder.cancel_relocation(target, key).await {
                Ok(_) => tracing::debug!(session_id = %session, %target, "reservation withdrawn"),
                Err(cancel) => tracing::warn!(
                    session_id = %session,
                    %target,
                    error = %cancel,
                    "cannot withdraw reservation"
                ),
            }
            return Err(e);
        }
        tracing::info!(session_id = %session, %target, %key, "relocation started");

        self.spawn_watchdog(handle, key);
        Ok(())
    }

    fn spawn_watchdog(self: &Arc<Self>, handle: Arc<SessionHandle>, key: RelocationKey) {
        let core = Arc::downgrade(self);
        let timeout = self.config.session.relocation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !handle.abandon(key) {
                return;
            }
            let session_id = handle.id();
            tracing::warn!(%session_id, "client did not reach relocation target");
            if let Some(core) = core.upgrade() {
                core.session_ended(session_id, false);
            }
        });
    }

    /// Source side: the client arrived at `target`. Hands back the messages
    /// held since the suspend.
    pub(crate) fn complete_relocation(
        &self,
        session: SessionId,
        key: RelocationKey,
        target: NodeId,
    ) -> Result<(Vec<OutboundMessage>, bool), SessionError> {
        let handle = self
            .handle(&session)
            .ok_or(SessionError::NotFound(session))?;
        let (held, disconnect) = handle
            .complete(key, target)
            .ok_or(SessionError::InvalidRelocationKey)?;
        self.directory().depart(&session, target);
        self.cluster.record_session(session, target);
        self.status.notify_relocated(&session, target);
        tracing::info!(session_id = %session, %target, held = held.len(), "session relocated");
        Ok((held, disconnect))
    }

    /// Target side: agrees to receive `session` from `source`.
    pub(crate) fn prepare_relocation(
        &self,
        key: RelocationKey,
        session: SessionId,
        identity: Identity,
        source: NodeId,
    ) -> Result<(), SessionError> {
        self.directory().reserve_relocation(
            key,
            PendingRelocation {
                session_id: session,
                identity,
                source,
            },
        )
    }

    /// Target side: the source gave up before telling the client.
    pub(crate) fn cancel_relocation(&self, key: &RelocationKey) -> bool {
        self.directory().cancel_relocation(key)
    }

    /// Target side: a client presented `key` in `RELOCATE_REQUEST`.
    pub(crate) async fn accept_relocation(
        self: &Arc<Self>,
        key: RelocationKey,
        protocol: Arc<SessionProtocol>,
    ) -> Result<LoginGrant, LoginError> {
        let pending = self.directory().take_relocation(&key)?;
        let session_id = pending.session_id;
        let handle = Arc::new(SessionHandle::arriving(
            session_id,
            pending.identity,
            Arc::downgrade(self),
            protocol,
        ));
        self.directory().register(session_id, Arc::clone(&handle))?;

        let handed_over = self
            .forwarder
            .complete_relocation(pending.source, session_id, key, self.node_id)
            .await;
        let (held, disconnect) = match handed_over {
            Ok(held) => held,
            Err(e) => {
                self.directory().remove(&session_id);
                handle.discard();
                return Err(e.into());
            }
        };

        let close_after = handle
            .activate(held, disconnect)
            .ok_or_else(|| LoginError::Refused("connection closed during relocation".into()))?;
        self.cluster.record_session(session_id, self.node_id);
        tracing::info!(%session_id, source = %pending.source, "session arrived");

        Ok(LoginGrant {
            handler: handle,
            reconnect_key: ReconnectKey::random(),
            close_after,
        })
    }
}
