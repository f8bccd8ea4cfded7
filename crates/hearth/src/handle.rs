//! Per-session handle: the node's view of one logged-in session.
//!
//! The handle sits between the delivery pipeline and the connection engine.
//! Flushed messages are written to the engine while the session is
//! connected and held here while it is suspended or moving between nodes.
//!
//! ```text
//! Connected ──suspend──→ Suspended ──resume──→ Connected
//!     │
//!     └──relocate──→ Relocating ──complete──→ Relocated(target)
//!                        │
//!                        └──watchdog──→ Disconnected
//!
//! Arriving ──activate──→ Connected        (target side of a relocation)
//! ```
//!
//! # Locking
//!
//! The handle lock is taken before the engine lock, never after. The
//! engine's `close` calls back into [`ProtocolHandler::disconnected`],
//! which takes the handle lock, so connections are only closed once the
//! handle lock is released.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use hearth_delivery::{OutboundMessage, Update};
use hearth_protocol::{ChannelId, ProtocolDescriptor};
use hearth_session::{Identity, NodeId, RelocationKey, SessionId};

use crate::engine::{ProtocolHandler, RequestOutcome, SessionProtocol, SuspendCompletion};
use crate::service::NodeCore;
use crate::{EngineError, HearthError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlePhase {
    Connected,
    Suspended,
    Relocating { target: NodeId, key: RelocationKey },
    Arriving,
    Relocated(NodeId),
    Disconnected,
}

struct HandleInner {
    protocol: Option<Arc<SessionProtocol>>,
    phase: HandlePhase,
    held: Vec<OutboundMessage>,
    disconnect_after_release: bool,
    /// A relocation is being arranged with the target node.
    claimed: bool,
}

/// What [`SessionHandle::deliver`] did with an update.
pub(crate) enum Delivered {
    Done,
    /// The session now lives on another node; the update is untouched.
    Forward(NodeId, Update),
}

pub(crate) struct SessionHandle {
    id: SessionId,
    identity: Identity,
    core: Weak<NodeCore>,
    inner: Mutex<HandleInner>,
}

impl SessionHandle {
    fn with_phase(
        id: SessionId,
        identity: Identity,
        core: Weak<NodeCore>,
        protocol: Arc<SessionProtocol>,
        phase: HandlePhase,
    ) -> Self {
        Self {
            id,
            identity,
            core,
            inner: Mutex::new(HandleInner {
                protocol: Some(protocol),
                phase,
                held: Vec::new(),
                disconnect_after_release: false,
                claimed: false,
            }),
        }
    }

    /// A freshly logged-in session.
    pub(crate) fn connected(
        id: SessionId,
        identity: Identity,
        core: Weak<NodeCore>,
        protocol: Arc<SessionProtocol>,
    ) -> Self {
        Self::with_phase(id, identity, core, protocol, HandlePhase::Connected)
    }

    /// A session arriving from another node. Messages are held until
    /// [`activate`](Self::activate).
    pub(crate) fn arriving(
        id: SessionId,
        identity: Identity,
        core: Weak<NodeCore>,
        protocol: Arc<SessionProtocol>,
    ) -> Self {
        Self::with_phase(id, identity, core, protocol, HandlePhase::Arriving)
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn identity(&self) -> &Identity {
        &self.identity
    }

    fn lock(&self) -> MutexGuard<'_, HandleInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn phase(&self) -> HandlePhase {
        self.lock().phase
    }

    /// `true` while this node is responsible for the session's connection.
    pub(crate) fn is_connected(&self) -> bool {
        let inner = self.lock();
        inner.protocol.is_some()
            && matches!(
                inner.phase,
                HandlePhase::Connected | HandlePhase::Suspended | HandlePhase::Arriving
            )
    }

    // -- delivery ---------------------------------------------------------

    /// Writes a flushed update, or holds it while messages are suspended.
    pub(crate) fn deliver(&self, update: Update) -> Delivered {
        let mut inner = self.lock();
        let to_close = match inner.phase {
            HandlePhase::Relocated(node) => return Delivered::Forward(node, update),
            HandlePhase::Disconnected => {
                tracing::debug!(session_id = %self.id, "update for disconnected session discarded");
                None
            }
            HandlePhase::Suspended | HandlePhase::Relocating { .. } | HandlePhase::Arriving => {
                let (messages, disconnect) = update.into_parts();
                tracing::trace!(session_id = %self.id, count = messages.len(), "holding messages");
                inner.held.extend(messages);
                inner.disconnect_after_release |= disconnect;
                None
            }
            HandlePhase::Connected => {
                let (messages, disconnect) = update.into_parts();
                match inner.protocol.clone() {
                    Some(protocol) => {
                        write_all(self.id, &protocol, messages);
                        disconnect.then_some(protocol)
                    }
                    None => None,
                }
            }
        };
        drop(inner);
        if let Some(protocol) = to_close {
            tracing::debug!(session_id = %self.id, "disconnect requested");
            protocol.close();
        }
        Delivered::Done
    }

    // -- suspend / resume -------------------------------------------------

    pub(crate) fn suspend(&self) -> Result<SuspendCompletion, HearthError> {
        let mut inner = self.lock();
        if inner.claimed {
            return Err(EngineError::Relocating.into());
        }
        match inner.phase {
            HandlePhase::Connected => {}
            HandlePhase::Suspended => return Err(EngineError::AlreadySuspending.into()),
            HandlePhase::Relocating { .. } | HandlePhase::Arriving => {
                return Err(EngineError::Relocating.into());
            }
            HandlePhase::Relocated(_) | HandlePhase::Disconnected => {
                return Err(EngineError::Closed.into());
            }
        }
        let protocol = inner.protocol.clone().ok_or(EngineError::Closed)?;
        let completion = protocol.suspend()?;
        inner.phase = HandlePhase::Suspended;
        Ok(completion)
    }

    /// Ends a suspend and writes everything held in the meantime.
    pub(crate) fn resume(&self) -> Result<(), HearthError> {
        let mut inner = self.lock();
        match inner.phase {
            HandlePhase::Suspended => {}
            HandlePhase::Relocating { .. } | HandlePhase::Arriving => {
                return Err(EngineError::Relocating.into());
            }
            _ => return Ok(()),
        }
        let protocol = inner.protocol.clone().ok_or(EngineError::Closed)?;
        protocol.resume()?;
        inner.phase = HandlePhase::Connected;
        let held = std::mem::take(&mut inner.held);
        let disconnect = std::mem::take(&mut inner.disconnect_after_release);
        write_all(self.id, &protocol, held);
        drop(inner);
        if disconnect {
            protocol.close();
        }
        Ok(())
    }

    // -- relocation -------------------------------------------------------

    fn check_relocatable(inner: &HandleInner) -> Result<(), EngineError> {
        if inner.claimed {
            return Err(EngineError::AlreadyRelocating);
        }
        match inner.phase {
            HandlePhase::Connected => Ok(()),
            HandlePhase::Suspended | HandlePhase::Relocating { .. } | HandlePhase::Arriving => {
                Err(EngineError::AlreadyRelocating)
            }
            HandlePhase::Relocated(_) | HandlePhase::Disconnected => Err(EngineError::Closed),
        }
    }

    /// Source side: reserves the session for one relocation before the
    /// target node is contacted. Suspends and further relocations fail
    /// until [`begin_relocation`](Self::begin_relocation) or
    /// [`release_claim`](Self::release_claim).
    pub(crate) fn claim_relocation(&self) -> Result<(), HearthError> {
        let mut inner = self.lock();
        Self::check_relocatable(&inner)?;
        inner.claimed = true;
        Ok(())
    }

    pub(crate) fn release_claim(&self) {
        self.lock().claimed = false;
    }

    /// Source side: starts moving the client to `target`. Consumes the
    /// claim taken by [`claim_relocation`](Self::claim_relocation).
    pub(crate) fn begin_relocation(
        &self,
        target: NodeId,
        descriptors: Vec<ProtocolDescriptor>,
        key: RelocationKey,
    ) -> Result<(), HearthError> {
        let mut inner = self.lock();
        inner.claimed = false;
        Self::check_relocatable(&inner)?;
        let protocol = inner.protocol.clone().ok_or(EngineError::Closed)?;
        protocol.relocate(descriptors, key)?;
        inner.phase = HandlePhase::Relocating { target, key };
        Ok(())
    }

    /// Source side: the client reached `target` with `key`. Returns the
    /// held messages and whether a disconnect was requested meanwhile, and
    /// closes the old connection without reporting a disconnect.
    pub(crate) fn complete(
        &self,
        key: RelocationKey,
        target: NodeId,
    ) -> Option<(Vec<OutboundMessage>, bool)> {
        let mut inner = self.lock();
        match inner.phase {
            HandlePhase::Relocating { target: t, key: k } if t == target && k == key => {}
            _ => return None,
        }
        inner.phase = HandlePhase::Relocated(target);
        let held = std::mem::take(&mut inner.held);
        let disconnect = std::mem::take(&mut inner.disconnect_after_release);
        let protocol = inner.protocol.take();
        drop(inner);
        if let Some(protocol) = protocol {
            protocol.close_quietly();
        }
        Some((held, disconnect))
    }

    /// Source side: the client never reached the target. Returns `false` if
    /// the relocation already finished some other way.
    pub(crate) fn abandon(&self, key: RelocationKey) -> bool {
        let mut inner = self.lock();
        match inner.phase {
            HandlePhase::Relocating { key: k, .. } if k == key => {}
            _ => return false,
        }
        inner.phase = HandlePhase::Disconnected;
        inner.held.clear();
        let protocol = inner.protocol.take();
        drop(inner);
        if let Some(protocol) = protocol {
            protocol.close_quietly();
        }
        true
    }

    /// Target side: the source handed over. Writes `source_held`, then
    /// anything held here, into the new connection. Returns whether the
    /// connection should close after them, or `None` if it already closed.
    pub(crate) fn activate(
        &self,
        source_held: Vec<OutboundMessage>,
        source_disconnect: bool,
    ) -> Option<bool> {
        let mut inner = self.lock();
        if inner.phase != HandlePhase::Arriving {
            return None;
        }
        let protocol = inner.protocol.clone()?;
        inner.phase = HandlePhase::Connected;
        let local = std::mem::take(&mut inner.held);
        let local_disconnect = std::mem::take(&mut inner.disconnect_after_release);
        tracing::debug!(
            session_id = %self.id,
            from_source = source_held.len(),
            from_target = local.len(),
            "releasing held messages"
        );
        write_all(self.id, &protocol, source_held);
        write_all(self.id, &protocol, local);
        Some(source_disconnect || local_disconnect)
    }

    /// Target side: the hand-over failed.
    pub(crate) fn discard(&self) {
        let mut inner = self.lock();
        inner.phase = HandlePhase::Disconnected;
        inner.held.clear();
        inner.protocol = None;
    }

    /// Closes the connection; the session ends through
    /// [`ProtocolHandler::disconnected`]. Returns `false` when there is no
    /// connection left to close.
    pub(crate) fn disconnect(&self) -> bool {
        let protocol = self.lock().protocol.clone();
        match protocol {
            Some(protocol) => {
                protocol.close();
                true
            }
            None => false,
        }
    }

    fn outcome(&self) -> RequestOutcome {
        match self.phase() {
            HandlePhase::Relocating { .. } => RequestOutcome::RelocatePending,
            HandlePhase::Disconnected | HandlePhase::Relocated(_) => {
                RequestOutcome::DisconnectPending
            }
            _ => RequestOutcome::Completed,
        }
    }
}

fn write_all(session_id: SessionId, protocol: &SessionProtocol, messages: Vec<OutboundMessage>) {
    for message in messages {
        if let Err(e) = protocol.deliver(message.body, message.delivery) {
            tracing::debug!(%session_id, error = %e, "message not delivered");
        }
    }
}

impl ProtocolHandler for SessionHandle {
    fn session_message(&self, payload: Bytes) -> RequestOutcome {
        if let HandlePhase::Relocating { .. } = self.phase() {
            return RequestOutcome::RelocatePending;
        }
        let Some(core) = self.core.upgrade() else {
            return RequestOutcome::DisconnectPending;
        };
        if let Err(e) = core.received_message(&self.id, payload) {
            return RequestOutcome::Failed(e.to_string());
        }
        self.outcome()
    }

    fn channel_message(&self, channel: ChannelId, payload: Bytes) -> RequestOutcome {
        if let HandlePhase::Relocating { .. } = self.phase() {
            return RequestOutcome::RelocatePending;
        }
        let Some(core) = self.core.upgrade() else {
            return RequestOutcome::DisconnectPending;
        };
        if let Err(e) = core.received_channel_message(&self.id, channel, payload) {
            return RequestOutcome::Failed(e.to_string());
        }
        self.outcome()
    }

    fn logout(&self) -> RequestOutcome {
        tracing::debug!(session_id = %self.id, "logout requested");
        RequestOutcome::Completed
    }

    fn disconnected(&self, graceful: bool) {
        {
            let mut inner = self.lock();
            match inner.phase {
                HandlePhase::Relocating { .. } => {
                    // The watchdog or the target decides what happens next.
                    inner.protocol = None;
                    tracing::debug!(session_id = %self.id, "old connection closed during relocation");
                    return;
                }
                HandlePhase::Relocated(_) | HandlePhase::Disconnected => return,
                HandlePhase::Connected | HandlePhase::Suspended | HandlePhase::Arriving => {
                    inner.phase = HandlePhase::Disconnected;
                    inner.protocol = None;
                    inner.held.clear();
                }
            }
        }
        if let Some(core) = self.core.upgrade() {
            core.session_ended(self.id, graceful);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_protocol::Delivery;

    fn update(bodies: &[&'static [u8]], disconnect: bool) -> Update {
        let mut update = Update::default();
        for body in bodies {
            update.push_back(OutboundMessage {
                body: Bytes::from_static(body),
                delivery: Delivery::Reliable,
            });
        }
        if disconnect {
            update.request_disconnect();
        }
        update
    }

    fn handle(phase: HandlePhase) -> SessionHandle {
        let (server, _client) = tokio::io::duplex(64);
        let channel = Arc::new(
            hearth_protocol::MessageChannel::new(
                hearth_transport::StreamConnection::new(server),
                64,
            )
            .expect("channel"),
        );
        let protocol = SessionProtocol::start(
            channel,
            crate::engine::EngineSettings {
                disconnect_delay: std::time::Duration::from_millis(10),
                relocation_timeout: std::time::Duration::from_millis(10),
                local: ProtocolDescriptor::tcp("127.0.0.1", 1),
            },
        );
        SessionHandle::with_phase(
            SessionId::new(NodeId(1), 1),
            Identity::new("ann"),
            Weak::new(),
            protocol,
            phase,
        )
    }

    #[tokio::test]
    async fn test_deliver_relocated_returns_update_for_forwarding() {
        let handle = handle(HandlePhase::Relocated(NodeId(2)));
        match handle.deliver(update(&[b"\x30a"], true)) {
            Delivered::Forward(node, update) => {
                assert_eq!(node, NodeId(2));
                assert!(update.disconnect());
                assert_eq!(update.messages().count(), 1);
            }
            Delivered::Done => panic!("expected forward"),
        }
    }

    #[tokio::test]
    async fn test_activate_releases_source_then_local_messages() {
        let handle = handle(HandlePhase::Arriving);
        handle.deliver(update(&[b"\x30local"], false));
        let released = handle.activate(
            vec![OutboundMessage {
                body: Bytes::from_static(b"\x30source"),
                delivery: Delivery::Reliable,
            }],
            false,
        );
        assert_eq!(released, Some(false));
        assert_eq!(handle.phase(), HandlePhase::Connected);
        assert!(handle.lock().held.is_empty());
    }

    #[tokio::test]
    async fn test_complete_with_wrong_key_leaves_relocation_pending() {
        let key = RelocationKey::random();
        let handle = handle(HandlePhase::Relocating {
            target: NodeId(2),
            key,
        });
        handle.deliver(update(&[b"\x30held"], false));

        assert!(handle.complete(RelocationKey::random(), NodeId(2)).is_none());
        assert!(handle.complete(key, NodeId(3)).is_none());

        let (held, disconnect) = handle.complete(key, NodeId(2)).expect("matching key");
        assert_eq!(held.len(), 1);
        assert!(!disconnect);
        assert_eq!(handle.phase(), HandlePhase::Relocated(NodeId(2)));
    }

    #[tokio::test]
    async fn test_abandon_only_matches_current_relocation() {
        let key = RelocationKey::random();
        let handle = handle(HandlePhase::Relocating {
            target: NodeId(2),
            key,
        });
        assert!(!handle.abandon(RelocationKey::random()));
        assert!(handle.abandon(key));
        assert_eq!(handle.phase(), HandlePhase::Disconnected);
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_claim_relocation_blocks_second_claim_and_suspend() {
        let handle = handle(HandlePhase::Connected);
        handle.claim_relocation().expect("first claim");
        assert!(matches!(
            handle.claim_relocation(),
            Err(HearthError::Engine(EngineError::AlreadyRelocating))
        ));
        assert!(matches!(
            handle.suspend(),
            Err(HearthError::Engine(EngineError::Relocating))
        ));

        handle.release_claim();
        handle.claim_relocation().expect("claim after release");
    }

    #[tokio::test]
    async fn test_claim_relocation_while_relocating_is_rejected() {
        let handle = handle(HandlePhase::Relocating {
            target: NodeId(2),
            key: RelocationKey::random(),
        });
        assert!(matches!(
            handle.claim_relocation(),
            Err(HearthError::Engine(EngineError::AlreadyRelocating))
        ));
        let gone = self::handle(HandlePhase::Relocated(NodeId(2)));
        assert!(matches!(
            gone.claim_relocation(),
            Err(HearthError::Engine(EngineError::Closed))
        ));
    }

    #[tokio::test]
    async fn test_suspend_twice_is_rejected() {
        let handle = handle(HandlePhase::Suspended);
        assert!(matches!(
            handle.suspend(),
            Err(HearthError::Engine(EngineError::AlreadySuspending))
        ));
    }
}
