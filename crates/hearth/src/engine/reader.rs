//! The per-connection read loop.

use std::future::Future;
use std::sync::Arc;

use hearth_protocol::{ClientMessage, MessageChannel, PROTOCOL_VERSION};
use hearth_session::{Identity, RelocationKey, SessionError};
use hearth_transport::{Connection, TransportError};

use super::{LoginGrant, RequestOutcome, SessionProtocol};
use crate::LoginError;

/// The node-side services a connection needs before it has a session.
///
/// `login` and `relocate` run on their own task while the connection keeps
/// reading. Anything they write to `protocol` before returning is buffered
/// and sent right after the outcome frame.
pub trait SessionAcceptor: Send + Sync + 'static {
    /// Checks `LOGIN_REQUEST` credentials.
    fn authenticate(
        &self,
        name: &str,
        password: &str,
    ) -> impl Future<Output = Result<Identity, LoginError>> + Send;

    /// Creates the session for an authenticated identity.
    fn login(
        self: Arc<Self>,
        identity: Identity,
        protocol: Arc<SessionProtocol>,
    ) -> impl Future<Output = Result<LoginGrant, LoginError>> + Send;

    /// Rebinds a session relocated from another node to this connection.
    fn relocate(
        self: Arc<Self>,
        key: RelocationKey,
        protocol: Arc<SessionProtocol>,
    ) -> impl Future<Output = Result<LoginGrant, LoginError>> + Send;
}

enum Flow {
    Continue,
    Stop,
}

/// Reads and dispatches client messages until the connection closes.
pub(crate) async fn run_connection<C, A>(
    channel: Arc<MessageChannel<C>>,
    protocol: Arc<SessionProtocol>,
    acceptor: Arc<A>,
) where
    C: Connection<Error = TransportError>,
    A: SessionAcceptor,
{
    let conn_id = channel.id();
    tracing::debug!(%conn_id, "connection started");

    loop {
        let read = tokio::select! {
            _ = protocol.wait_closed() => break,
            read = channel.read() => read,
        };
        let body = match read {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::debug!(%conn_id, "peer closed connection");
                break;
            }
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "read failed");
                break;
            }
        };
        let message = match ClientMessage::decode(body) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(%conn_id, error = %e, "protocol violation, closing");
                break;
            }
        };
        match dispatch(message, &protocol, &acceptor).await {
            Flow::Continue => {}
            Flow::Stop => break,
        }
    }

    protocol.close();
    tracing::debug!(%conn_id, "connection finished");
}

async fn dispatch<A: SessionAcceptor>(
    message: ClientMessage,
    protocol: &Arc<SessionProtocol>,
    acceptor: &Arc<A>,
) -> Flow {
    let conn_id = protocol.id();
    match message {
        ClientMessage::LoginRequest {
            version,
            name,
            password,
        } => {
            if !check_version(protocol, version) {
                return Flow::Stop;
            }
            if !protocol.begin_login() {
                tracing::error!(%conn_id, "second login attempt on one connection");
                return Flow::Stop;
            }
            match acceptor.authenticate(&name, &password).await {
                Ok(identity) => {
                    tracing::debug!(%conn_id, %identity, "authenticated");
                    let acceptor = Arc::clone(acceptor);
                    let protocol = Arc::clone(protocol);
                    tokio::spawn(async move {
                        let result = acceptor.login(identity, Arc::clone(&protocol)).await;
                        protocol.login_completed(result);
                    });
                }
                Err(e) => protocol.login_completed(Err(e)),
            }
            Flow::Continue
        }

        ClientMessage::RelocateRequest { version, key } => {
            if !check_version(protocol, version) {
                return Flow::Stop;
            }
            if !protocol.begin_login() {
                tracing::error!(%conn_id, "relocation attempt on a used connection");
                return Flow::Stop;
            }
            match RelocationKey::from_slice(&key) {
                Some(key) => {
                    let acceptor = Arc::clone(acceptor);
                    let protocol = Arc::clone(protocol);
                    tokio::spawn(async move {
                        let result = acceptor.relocate(key, Arc::clone(&protocol)).await;
                        protocol.relocate_completed(result);
                    });
                }
                None => protocol.relocate_completed(Err(SessionError::InvalidRelocationKey.into())),
            }
            Flow::Continue
        }

        ClientMessage::SessionMessage { payload } => {
            let Some(handler) = application_handler(protocol) else {
                return Flow::Continue;
            };
            apply_outcome(protocol, handler.session_message(payload)).await
        }

        ClientMessage::ChannelMessage { channel, payload } => {
            let Some(handler) = application_handler(protocol) else {
                return Flow::Continue;
            };
            apply_outcome(protocol, handler.channel_message(channel, payload)).await
        }

        ClientMessage::LogoutRequest => {
            let Some(handler) = protocol.handler() else {
                tracing::debug!(%conn_id, "logout before login, closing");
                return Flow::Stop;
            };
            if let RequestOutcome::Failed(reason) = handler.logout() {
                tracing::debug!(%conn_id, %reason, "logout failed");
            }
            protocol.logout_completed();
            Flow::Stop
        }

        ClientMessage::SuspendMessagesComplete => {
            protocol.suspend_acknowledged();
            Flow::Continue
        }
    }
}

fn check_version(protocol: &SessionProtocol, version: u8) -> bool {
    if version == PROTOCOL_VERSION {
        return true;
    }
    tracing::error!(
        conn_id = %protocol.id(),
        expected = PROTOCOL_VERSION,
        got = version,
        "protocol version mismatch, closing"
    );
    false
}

/// The bound handler, if application messages may be read right now.
fn application_handler(
    protocol: &SessionProtocol,
) -> Option<Arc<dyn super::ProtocolHandler>> {
    let Some(handler) = protocol.handler() else {
        tracing::debug!(conn_id = %protocol.id(), "message before login dropped");
        return None;
    };
    if protocol.application_reads_paused() {
        tracing::debug!(conn_id = %protocol.id(), "message during relocation dropped");
        return None;
    }
    Some(handler)
}

async fn apply_outcome(protocol: &SessionProtocol, outcome: RequestOutcome) -> Flow {
    match outcome {
        RequestOutcome::Completed => Flow::Continue,
        RequestOutcome::Failed(reason) => {
            tracing::debug!(conn_id = %protocol.id(), %reason, "request failed");
            Flow::Continue
        }
        RequestOutcome::DisconnectPending => {
            protocol.wait_closed().await;
            Flow::Stop
        }
        RequestOutcome::RelocatePending => {
            protocol.pause_application_reads();
            Flow::Continue
        }
    }
}
