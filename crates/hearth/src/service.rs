//! The node session service.
//!
//! [`NodeCore`] owns everything node-scoped: the session directory, the
//! delivery pipeline, the remote forwarder, and the listeners. It logs
//! sessions in, ends them, and flushes committed updates to wherever each
//! session's connection lives. [`SessionService`] is the cloneable handle
//! applications use.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use hearth_delivery::{DeliveryPipeline, FlushTarget, TransactionContext, Update};
use hearth_protocol::{ChannelId, Delivery, ServerMessage};
use hearth_session::{
    Authenticator, Identity, NodeId, ReconnectKey, RelocationKey, SessionDirectory, SessionId,
    SessionIdGenerator, SessionStatusListener, StatusListeners,
};
use tokio::task::JoinHandle;

use crate::cluster::ClusterMap;
use crate::config::NodeConfig;
use crate::engine::{LoginGrant, SessionAcceptor, SessionProtocol, SuspendCompletion};
use crate::forward::RemoteForwarder;
use crate::handle::{Delivered, SessionHandle};
use crate::{ForwardError, HearthError, LoginError};

// ---------------------------------------------------------------------------
// Application callbacks
// ---------------------------------------------------------------------------

/// Application callbacks for session events.
///
/// Each callback runs inside its own delivery transaction: messages sent
/// through `ctx` are delivered only once the callback returns and the
/// transaction commits. Callbacks are synchronous and must not block.
///
/// # Example
///
/// ```rust,ignore
/// struct Echo;
///
/// impl SessionListener for Echo {
///     fn received_message(&self, ctx: &TransactionContext, session: &SessionId, payload: Bytes) {
///         let _ = ctx.send_session_message(*session, payload, Delivery::Reliable);
///     }
/// }
/// ```
pub trait SessionListener: Send + Sync + 'static {
    /// A new session was created. Returning an error refuses the login.
    fn logged_in(
        &self,
        _ctx: &TransactionContext,
        _session: &SessionId,
        _identity: &Identity,
    ) -> Result<(), LoginError> {
        Ok(())
    }

    fn received_message(&self, _ctx: &TransactionContext, _session: &SessionId, _payload: Bytes) {}

    fn received_channel_message(
        &self,
        _ctx: &TransactionContext,
        _session: &SessionId,
        _channel: ChannelId,
        _payload: Bytes,
    ) {
    }

    /// The session ended. Not called when it moved to another node.
    fn disconnected(&self, _ctx: &TransactionContext, _session: &SessionId, _graceful: bool) {}
}

/// A listener that accepts every login and ignores every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SessionListener for NoopListener {}

/// Encodes protocol messages into a transaction's session output.
pub trait SessionOutput {
    fn send_session_message(
        &self,
        session: SessionId,
        payload: Bytes,
        delivery: Delivery,
    ) -> Result<(), HearthError>;

    fn send_channel_join(
        &self,
        session: SessionId,
        name: &str,
        channel: ChannelId,
    ) -> Result<(), HearthError>;

    fn send_channel_leave(&self, session: SessionId, channel: ChannelId)
    -> Result<(), HearthError>;

    fn send_channel_message(
        &self,
        session: SessionId,
        channel: ChannelId,
        payload: Bytes,
        delivery: Delivery,
    ) -> Result<(), HearthError>;
}

impl SessionOutput for TransactionContext {
    fn send_session_message(
        &self,
        session: SessionId,
        payload: Bytes,
        delivery: Delivery,
    ) -> Result<(), HearthError> {
        let body = ServerMessage::SessionMessage { payload }.encode()?;
        self.send(session, body, delivery)?;
        Ok(())
    }

    fn send_channel_join(
        &self,
        session: SessionId,
        name: &str,
        channel: ChannelId,
    ) -> Result<(), HearthError> {
        let body = ServerMessage::ChannelJoin {
            name: name.to_owned(),
            channel,
        }
        .encode()?;
        self.send(session, body, Delivery::Reliable)?;
        Ok(())
    }

    fn send_channel_leave(
        &self,
        session: SessionId,
        channel: ChannelId,
    ) -> Result<(), HearthError> {
        let body = ServerMessage::ChannelLeave { channel }.encode()?;
        self.send(session, body, Delivery::Reliable)?;
        Ok(())
    }

    fn send_channel_message(
        &self,
        session: SessionId,
        channel: ChannelId,
        payload: Bytes,
        delivery: Delivery,
    ) -> Result<(), HearthError> {
        let body = ServerMessage::ChannelMessage { channel, payload }.encode()?;
        self.send(session, body, delivery)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// NodeCore
// ---------------------------------------------------------------------------

pub(crate) struct NodeCore {
    pub(crate) node_id: NodeId,
    pub(crate) config: NodeConfig,
    ids: SessionIdGenerator,
    directory: Mutex<SessionDirectory<Arc<SessionHandle>>>,
    pub(crate) pipeline: DeliveryPipeline,
    pub(crate) cluster: Arc<dyn ClusterMap>,
    pub(crate) forwarder: RemoteForwarder,
    listener: Arc<dyn SessionListener>,
    pub(crate) status: StatusListeners,
}

impl NodeCore {
    pub(crate) fn new(
        config: NodeConfig,
        cluster: Arc<dyn ClusterMap>,
        listener: Arc<dyn SessionListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: config.node_id,
            ids: SessionIdGenerator::new(config.node_id),
            directory: Mutex::new(SessionDirectory::new(config.session)),
            pipeline: DeliveryPipeline::new(),
            forwarder: RemoteForwarder::new(Arc::clone(&cluster)),
            cluster,
            listener,
            status: StatusListeners::new(),
            config,
        })
    }

    pub(crate) fn directory(&self) -> MutexGuard<'_, SessionDirectory<Arc<SessionHandle>>> {
        self.directory
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn handle(&self, session: &SessionId) -> Option<Arc<SessionHandle>> {
        self.directory().get(session).cloned()
    }

    // -- login --------------------------------------------------------------

    pub(crate) fn login(
        self: &Arc<Self>,
        identity: Identity,
        protocol: Arc<SessionProtocol>,
    ) -> Result<LoginGrant, LoginError> {
        let assigned = self.cluster.assign(&identity, self.node_id);
        if assigned != self.node_id {
            let descriptors = self
                .cluster
                .descriptors(assigned)
                .ok_or(ForwardError::UnknownNode(assigned))?;
            return Err(LoginError::Redirect {
                node: assigned,
                descriptors,
            });
        }

        let session_id = self.ids.next_id();
        let handle = Arc::new(SessionHandle::connected(
            session_id,
            identity.clone(),
            Arc::downgrade(self),
            protocol,
        ));

        let ctx = self.pipeline.begin();
        self.listener.logged_in(&ctx, &session_id, &identity)?;
        self.directory().register(session_id, Arc::clone(&handle))?;
        if let Err(e) = ctx.prepare_and_commit() {
            self.directory().remove(&session_id);
            return Err(e.into());
        }
        self.cluster.record_session(session_id, self.node_id);

        tracing::info!(%session_id, %identity, node = %self.node_id, "session logged in");
        Ok(LoginGrant {
            handler: handle,
            reconnect_key: ReconnectKey::random(),
            close_after: false,
        })
    }

    /// Removes a session that will not come back and tells everyone.
    pub(crate) fn session_ended(&self, session_id: SessionId, graceful: bool) {
        if self.directory().remove(&session_id).is_none() {
            return;
        }
        self.cluster.mark_disconnected(&session_id, self.node_id);
        let ctx = self.pipeline.begin();
        self.listener.disconnected(&ctx, &session_id, graceful);
        if let Err(e) = ctx.prepare_and_commit() {
            tracing::warn!(%session_id, error = %e, "disconnect output dropped");
        }
        self.status.notify_disconnected(&session_id);
        tracing::info!(%session_id, graceful, "session ended");
    }

    // -- inbound application messages ----------------------------------------

    pub(crate) fn received_message(
        &self,
        session: &SessionId,
        payload: Bytes,
    ) -> Result<(), HearthError> {
        let ctx = self.pipeline.begin();
        self.listener.received_message(&ctx, session, payload);
        ctx.prepare_and_commit()?;
        Ok(())
    }

    pub(crate) fn received_channel_message(
        &self,
        session: &SessionId,
        channel: ChannelId,
        payload: Bytes,
    ) -> Result<(), HearthError> {
        let ctx = self.pipeline.begin();
        self.listener
            .received_channel_message(&ctx, session, channel, payload);
        ctx.prepare_and_commit()?;
        Ok(())
    }

    // -- delivery ------------------------------------------------------------

    /// Hands `update` to the local handle, or on to the node a session
    /// recently relocated to. Gives it back if the session is unknown here.
    pub(crate) async fn deliver_local(
        &self,
        session: SessionId,
        update: Update,
    ) -> Result<(), Update> {
        let Some(handle) = self.handle(&session) else {
            let moved = self.directory().moved_to(&session);
            let Some(node) = moved else {
                return Err(update);
            };
            tracing::trace!(%session, %node, "following relocated session");
            self.forward(node, session, update).await;
            return Ok(());
        };
        if let Delivered::Forward(node, update) = handle.deliver(update) {
            self.forward(node, session, update).await;
        }
        Ok(())
    }

    async fn forward(&self, node: NodeId, session: SessionId, update: Update) {
        match self.forwarder.send_messages(node, session, update).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(%session, %node, "remote node no longer has session");
                self.cluster.mark_disconnected(&session, node);
            }
            Err(e) => {
                tracing::warn!(%session, %node, error = %e, "forwarding failed");
            }
        }
    }

    /// Ends relocations the client never finished.
    fn expire_relocations(&self) {
        for stale in self.directory().expire_stale() {
            tracing::debug!(
                session_id = %stale.session_id,
                source = %stale.source,
                "pending relocation expired"
            );
        }
    }

    pub(crate) fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.session.relocation_timeout.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(core) = weak.upgrade() else { break };
                if core.pipeline.is_shut_down() {
                    break;
                }
                core.expire_relocations();
            }
        })
    }

    pub(crate) fn shutdown(&self) {
        self.pipeline.shutdown();
        let sessions = self.directory().drain();
        for (_, handle) in sessions {
            handle.disconnect();
        }
    }
}

impl FlushTarget for NodeCore {
    async fn flush_update(&self, session: SessionId, update: Update) {
        let Err(update) = self.deliver_local(session, update).await else {
            return;
        };
        match self.cluster.session_node(&session) {
            Some(node) if node != self.node_id => self.forward(node, session, update).await,
            _ => tracing::debug!(%session, "update for unknown session discarded"),
        }
    }
}

// ---------------------------------------------------------------------------
// Connection entry points
// ---------------------------------------------------------------------------

/// Node state shared by every connection: the core plus the authenticator.
pub(crate) struct NodeState<A> {
    pub(crate) core: Arc<NodeCore>,
    pub(crate) auth: A,
}

impl<A: Authenticator> SessionAcceptor for NodeState<A> {
    async fn authenticate(&self, name: &str, password: &str) -> Result<Identity, LoginError> {
        Ok(self.auth.authenticate(name, password).await?)
    }

    async fn login(
        self: Arc<Self>,
        identity: Identity,
        protocol: Arc<SessionProtocol>,
    ) -> Result<LoginGrant, LoginError> {
        self.core.login(identity, protocol)
    }

    async fn relocate(
        self: Arc<Self>,
        key: RelocationKey,
        protocol: Arc<SessionProtocol>,
    ) -> Result<LoginGrant, LoginError> {
        self.core.accept_relocation(key, protocol).await
    }
}

// ---------------------------------------------------------------------------
// SessionService
// ---------------------------------------------------------------------------

/// Application-facing handle to one node's sessions.
#[derive(Clone)]
pub struct SessionService {
    pub(crate) core: Arc<NodeCore>,
}

impl SessionService {
    pub fn node_id(&self) -> NodeId {
        self.core.node_id
    }

    /// Starts a transaction whose session output is delivered on commit.
    pub fn begin(&self) -> TransactionContext {
        self.core.pipeline.begin()
    }

    /// Sessions currently hosted here.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.core.directory().ids()
    }

    pub fn session_count(&self) -> usize {
        self.core.directory().len()
    }

    pub fn identity(&self, session: &SessionId) -> Option<Identity> {
        self.core.handle(session).map(|h| h.identity().clone())
    }

    pub fn register_status_listener(&self, listener: Arc<dyn SessionStatusListener>) {
        self.core.status.register(listener);
    }

    /// Whether `session` has a live connection anywhere in the cluster.
    pub async fn is_connected(&self, session: &SessionId) -> Result<bool, HearthError> {
        if let Some(handle) = self.core.handle(session) {
            return Ok(handle.is_connected());
        }
        match self.core.cluster.session_node(session) {
            Some(node) if node != self.core.node_id => {
                Ok(self.core.forwarder.is_connected(node, *session).await?)
            }
            _ => Ok(false),
        }
    }

    /// Closes the session's connection, wherever it is.
    pub async fn disconnect(&self, session: &SessionId) -> Result<bool, HearthError> {
        if let Some(handle) = self.core.handle(session) {
            if !handle.disconnect() {
                self.core.session_ended(*session, false);
            }
            return Ok(true);
        }
        match self.core.cluster.session_node(session) {
            Some(node) if node != self.core.node_id => {
                Ok(self.core.forwarder.disconnect(node, *session).await?)
            }
            _ => Ok(false),
        }
    }

    /// Holds the session's outbound messages until [`resume`](Self::resume).
    ///
    /// # Errors
    /// - [`HearthError::UnknownSession`] if the session is not hosted here
    /// - `AlreadySuspending` / `Relocating` state errors
    pub fn suspend(&self, session: &SessionId) -> Result<SuspendCompletion, HearthError> {
        let handle = self
            .core
            .handle(session)
            .ok_or(HearthError::UnknownSession(*session))?;
        handle.suspend()
    }

    pub fn resume(&self, session: &SessionId) -> Result<(), HearthError> {
        let handle = self
            .core
            .handle(session)
            .ok_or(HearthError::UnknownSession(*session))?;
        handle.resume()
    }

    /// Moves the session's client connection to `target`.
    pub async fn relocate(&self, session: &SessionId, target: NodeId) -> Result<(), HearthError> {
        self.core.relocate(*session, target).await
    }
}
