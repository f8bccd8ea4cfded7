//! Connection engine: the per-connection protocol state machine.
//!
//! Each accepted connection gets one [`SessionProtocol`] plus two tasks: a
//! read loop ([`run_connection`]) that decodes client messages and drives
//! login, relocation, and logout; and a writer task that owns the outbound
//! half and writes frames strictly in the order they were enqueued.
//!
//! ```text
//! unauthenticated ──LOGIN_REQUEST──→ authenticating ──LOGIN_SUCCESS──→ authenticated
//!        │                                 │
//!        └──RELOCATE_REQUEST──→ ...        └──LOGIN_FAILURE / LOGIN_REDIRECT──→ (disconnect timer)
//! ```
//!
//! # Locking
//!
//! The engine state sits behind a `std::sync::Mutex` that is never held
//! across an `.await`. When a session handle and the engine are both
//! locked, the handle's lock is taken first.

mod mobility;
mod reader;
mod writer;

pub use mobility::SuspendCompletion;
pub use reader::SessionAcceptor;
pub(crate) use reader::run_connection;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use hearth_protocol::{
    ChannelId, Delivery, MessageChannel, ProtocolDescriptor, ServerMessage, encode_frame,
};
use hearth_session::{ReconnectKey, RelocationKey};
use hearth_transport::{Connection, ConnectionId, TransportError};
use tokio::sync::{Notify, mpsc};

use crate::{EngineError, HearthError, LoginError};

/// Reason sent with every `LOGIN_FAILURE`.
pub const LOGIN_REFUSED: &str = "login refused";
/// Reason sent with every `RELOCATE_FAILURE`.
pub const RELOCATION_REFUSED: &str = "relocation refused";

/// What the session handler decided about an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed,
    /// The request failed; reading continues.
    Failed(String),
    /// The session is being disconnected. Nothing more is read.
    DisconnectPending,
    /// The session is moving to another node. Application traffic is no
    /// longer read; the relocation handshake still is.
    RelocatePending,
}

/// Receives a logged-in client's requests.
///
/// Calls are made from the connection's read task, one at a time.
pub trait ProtocolHandler: Send + Sync + 'static {
    fn session_message(&self, payload: Bytes) -> RequestOutcome;

    fn channel_message(&self, channel: ChannelId, payload: Bytes) -> RequestOutcome;

    fn logout(&self) -> RequestOutcome;

    /// The connection closed. Called at most once, and not at all when the
    /// session was relocated away.
    fn disconnected(&self, graceful: bool);
}

/// A successful login or relocation.
pub struct LoginGrant {
    pub handler: Arc<dyn ProtocolHandler>,
    pub reconnect_key: ReconnectKey,
    /// Close once the outcome and everything buffered before it is written.
    pub close_after: bool,
}

/// Per-connection settings taken from the node configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub disconnect_delay: Duration,
    pub relocation_timeout: Duration,
    /// The acceptor this connection arrived on.
    pub local: ProtocolDescriptor,
}

pub(crate) enum WriterCommand {
    Frame(Bytes),
    /// Close the connection once every frame queued before this is written.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoginPhase {
    Unauthenticated,
    Authenticating,
    Handled,
}

struct SuspendState {
    completed: bool,
    waiter: Option<tokio::sync::oneshot::Sender<()>>,
}

struct RelocationInfo {
    descriptors: Vec<ProtocolDescriptor>,
    key: RelocationKey,
}

struct EngineState {
    login: LoginPhase,
    /// Frames enqueued before the login outcome was sent.
    pre_login: Vec<Bytes>,
    handler: Option<Arc<dyn ProtocolHandler>>,
    suspend: Option<SuspendState>,
    relocation: Option<RelocationInfo>,
    app_reads_paused: bool,
    logged_out: bool,
    closed: bool,
}

/// Outbound side and shared state of one client connection.
pub struct SessionProtocol {
    conn_id: ConnectionId,
    settings: EngineSettings,
    writer: mpsc::UnboundedSender<WriterCommand>,
    state: Mutex<EngineState>,
    closed: Notify,
}

impl SessionProtocol {
    /// Creates the engine for `channel` and starts its writer task.
    pub fn start<C>(channel: Arc<MessageChannel<C>>, settings: EngineSettings) -> Arc<Self>
    where
        C: Connection<Error = TransportError>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let protocol = Arc::new(Self {
            conn_id: channel.id(),
            settings,
            writer: tx,
            state: Mutex::new(EngineState {
                login: LoginPhase::Unauthenticated,
                pre_login: Vec::new(),
                handler: None,
                suspend: None,
                relocation: None,
                app_reads_paused: false,
                logged_out: false,
                closed: false,
            }),
            closed: Notify::new(),
        });
        tokio::spawn(writer::run_writer(channel, rx, Arc::downgrade(&protocol)));
        protocol
    }

    pub fn id(&self) -> ConnectionId {
        self.conn_id
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Resolves once [`close`](Self::close) has run.
    pub(crate) async fn wait_closed(&self) {
        if self.is_closed() {
            return;
        }
        self.closed.notified().await;
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn ProtocolHandler>> {
        self.lock().handler.clone()
    }

    // -- outbound ---------------------------------------------------------

    /// Hands `frame` to the writer, or buffers it until the login outcome
    /// has been sent.
    fn push(&self, state: &mut EngineState, frame: Bytes) -> Result<(), EngineError> {
        if state.login != LoginPhase::Handled {
            state.pre_login.push(frame);
            return Ok(());
        }
        self.writer
            .send(WriterCommand::Frame(frame))
            .map_err(|_| EngineError::Closed)
    }

    fn enqueue_application(&self, frame: Bytes) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        if state.relocation.is_some() {
            return Err(EngineError::Relocating);
        }
        if state.suspend.is_some() {
            return Err(EngineError::Suspended);
        }
        self.push(&mut state, frame)
    }

    fn enqueue_control(&self, frame: Bytes) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        self.push(&mut state, frame)
    }

    /// Sends an application payload as `SESSION_MESSAGE`.
    ///
    /// Client connections are stream transports that are reliable and
    /// ordered, which satisfies every [`Delivery`] level, so the requested
    /// level never changes how a frame is written. The same holds for
    /// [`channel_message`](Self::channel_message) and
    /// [`deliver`](Self::deliver).
    ///
    /// # Errors
    /// - `MessageTooLong` if `payload` exceeds the application maximum
    /// - [`EngineError::Suspended`] / [`EngineError::Relocating`] while
    ///   messages are held
    pub fn session_message(&self, payload: Bytes, _delivery: Delivery) -> Result<(), HearthError> {
        let frame = ServerMessage::SessionMessage { payload }.frame()?;
        self.enqueue_application(frame)?;
        Ok(())
    }

    pub fn channel_join(&self, name: &str, channel: ChannelId) -> Result<(), HearthError> {
        let frame = ServerMessage::ChannelJoin {
            name: name.to_owned(),
            channel,
        }
        .frame()?;
        self.enqueue_application(frame)?;
        Ok(())
    }

    pub fn channel_leave(&self, channel: ChannelId) -> Result<(), HearthError> {
        let frame = ServerMessage::ChannelLeave { channel }.frame()?;
        self.enqueue_application(frame)?;
        Ok(())
    }

    pub fn channel_message(
        &self,
        channel: ChannelId,
        payload: Bytes,
        _delivery: Delivery,
    ) -> Result<(), HearthError> {
        let frame = ServerMessage::ChannelMessage { channel, payload }.frame()?;
        self.enqueue_application(frame)?;
        Ok(())
    }

    /// Sends an already encoded message body, as produced by the delivery
    /// pipeline.
    pub fn deliver(&self, body: Bytes, _delivery: Delivery) -> Result<(), HearthError> {
        let frame = encode_frame(&body)?;
        self.enqueue_application(frame)?;
        Ok(())
    }

    // -- login / relocation outcomes --------------------------------------

    /// Moves from unauthenticated to authenticating. Returns `false` if a
    /// login or relocation was already attempted on this connection.
    pub(crate) fn begin_login(&self) -> bool {
        let mut state = self.lock();
        if state.login != LoginPhase::Unauthenticated {
            return false;
        }
        state.login = LoginPhase::Authenticating;
        true
    }

    /// Writes the login outcome frame, then everything buffered before it.
    /// Returns `false` if the connection already closed.
    fn finish_login(&self, outcome: Bytes, handler: Option<Arc<dyn ProtocolHandler>>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.login = LoginPhase::Handled;
        if handler.is_some() {
            state.handler = handler;
        }
        let _ = self.writer.send(WriterCommand::Frame(outcome));
        for frame in state.pre_login.drain(..) {
            let _ = self.writer.send(WriterCommand::Frame(frame));
        }
        true
    }

    fn encode_or_log(&self, message: ServerMessage) -> Option<Bytes> {
        match message.frame() {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!(conn_id = %self.conn_id, error = %e, "cannot encode outcome");
                None
            }
        }
    }

    /// Completes a `LOGIN_REQUEST`.
    pub fn login_completed(self: &Arc<Self>, result: Result<LoginGrant, LoginError>) {
        match result {
            Ok(grant) => {
                let message = ServerMessage::LoginSuccess {
                    reconnect_key: Bytes::copy_from_slice(grant.reconnect_key.as_bytes()),
                };
                let Some(frame) = self.encode_or_log(message) else {
                    self.close();
                    grant.handler.disconnected(false);
                    return;
                };
                let handler = Arc::clone(&grant.handler);
                if !self.finish_login(frame, Some(grant.handler)) {
                    handler.disconnected(false);
                    return;
                }
                tracing::debug!(conn_id = %self.conn_id, "login succeeded");
                if grant.close_after {
                    self.close();
                }
            }
            Err(LoginError::Redirect { node, descriptors }) => {
                match self.settings.local.first_supported(&descriptors) {
                    Some(descriptor) => {
                        tracing::debug!(conn_id = %self.conn_id, %node, %descriptor, "redirecting login");
                        let message = ServerMessage::LoginRedirect {
                            target: descriptor.connect_info(),
                        };
                        if let Some(frame) = self.encode_or_log(message) {
                            self.finish_login(frame, None);
                        }
                        self.monitor_disconnection(self.settings.disconnect_delay);
                    }
                    None => {
                        tracing::error!(
                            conn_id = %self.conn_id,
                            %node,
                            "redirect node has no compatible protocol"
                        );
                        self.login_failure();
                    }
                }
            }
            Err(e) => {
                tracing::debug!(conn_id = %self.conn_id, error = %e, "login failed");
                self.login_failure();
            }
        }
    }

    fn login_failure(self: &Arc<Self>) {
        let message = ServerMessage::LoginFailure {
            reason: LOGIN_REFUSED.into(),
        };
        if let Some(frame) = self.encode_or_log(message) {
            self.finish_login(frame, None);
        }
        self.monitor_disconnection(self.settings.disconnect_delay);
    }

    /// Completes a `RELOCATE_REQUEST`.
    pub fn relocate_completed(self: &Arc<Self>, result: Result<LoginGrant, LoginError>) {
        match result {
            Ok(grant) => {
                let message = ServerMessage::RelocateSuccess {
                    reconnect_key: Bytes::copy_from_slice(grant.reconnect_key.as_bytes()),
                };
                let Some(frame) = self.encode_or_log(message) else {
                    self.close();
                    grant.handler.disconnected(false);
                    return;
                };
                let handler = Arc::clone(&grant.handler);
                if !self.finish_login(frame, Some(grant.handler)) {
                    handler.disconnected(false);
                    return;
                }
                tracing::debug!(conn_id = %self.conn_id, "relocation accepted");
                if grant.close_after {
                    self.close();
                }
            }
            Err(e) => {
                tracing::debug!(conn_id = %self.conn_id, error = %e, "relocation failed");
                let message = ServerMessage::RelocateFailure {
                    reason: RELOCATION_REFUSED.into(),
                };
                if let Some(frame) = self.encode_or_log(message) {
                    self.finish_login(frame, None);
                }
                self.monitor_disconnection(self.settings.disconnect_delay);
            }
        }
    }

    /// Sends `LOGOUT_SUCCESS` and closes once it has been written.
    pub(crate) fn logout_completed(&self) {
        {
            let mut state = self.lock();
            state.logged_out = true;
        }
        let sent = ServerMessage::LogoutSuccess
            .frame()
            .map_err(HearthError::from)
            .and_then(|frame| self.enqueue_control(frame).map_err(HearthError::from));
        if let Err(e) = sent {
            tracing::debug!(conn_id = %self.conn_id, error = %e, "logout reply not sent");
        }
        self.close();
    }

    // -- reading ----------------------------------------------------------

    pub(crate) fn pause_application_reads(&self) {
        self.lock().app_reads_paused = true;
    }

    pub(crate) fn application_reads_paused(&self) -> bool {
        self.lock().app_reads_paused
    }

    // -- closing ----------------------------------------------------------

    /// Closes the connection once queued frames are written, if the peer has
    /// not closed it first, after `delay`.
    pub(crate) fn monitor_disconnection(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(protocol) = weak.upgrade() {
                if !protocol.is_closed() {
                    tracing::debug!(conn_id = %protocol.conn_id, "disconnect timer expired");
                    protocol.close();
                }
            }
        });
    }

    /// Closes the connection and notifies the bound handler. Closing twice
    /// is a no-op.
    pub fn close(&self) {
        self.shutdown(true);
    }

    /// Closes without notifying the handler; used once the session lives
    /// on another node.
    pub(crate) fn close_quietly(&self) {
        self.shutdown(false);
    }

    fn shutdown(&self, notify: bool) {
        let (handler, graceful) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pre_login.clear();
            state.suspend = None;
            state.relocation = None;
            (state.handler.take(), state.logged_out)
        };
        let _ = self.writer.send(WriterCommand::Close);
        self.closed.notify_one();
        tracing::debug!(conn_id = %self.conn_id, graceful, "connection closing");
        if notify {
            if let Some(handler) = handler {
                handler.disconnected(graceful);
            }
        }
    }
}
