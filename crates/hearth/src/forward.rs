//! Remote forwarding: the node-to-node session server and its client.
//!
//! Nodes talk over plain TCP. Each frame is a big-endian `u32` length
//! followed by a request or response encoded with the node's [`Codec`]
//! ([`JsonCodec`]). One request is in flight per connection; the answer
//! comes back on the same connection.
//!
//! [`RemoteForwarder`] keeps one lazily connected client per node. Each
//! client is a small task fed over a channel, so callers never share a
//! socket. Any I/O failure drops the socket; the next call reconnects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hearth_delivery::{OutboundMessage, Update};
use hearth_protocol::{Codec, Delivery, JsonCodec};
use hearth_session::{Identity, NodeId, RelocationKey, SessionId};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::ForwardError;
use crate::cluster::ClusterMap;
use crate::service::NodeCore;

/// Largest RPC frame either side accepts.
pub const MAX_RPC_FRAME: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One encoded protocol message body and its delivery requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct WireMessage {
    pub(crate) body: Vec<u8>,
    pub(crate) delivery: Delivery,
}

impl From<OutboundMessage> for WireMessage {
    fn from(message: OutboundMessage) -> Self {
        Self {
            body: message.body.to_vec(),
            delivery: message.delivery,
        }
    }
}

impl From<WireMessage> for OutboundMessage {
    fn from(message: WireMessage) -> Self {
        Self {
            body: message.body.into(),
            delivery: message.delivery,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum RpcRequest {
    IsConnected {
        session: SessionId,
    },
    SendMessage {
        session: SessionId,
        message: WireMessage,
    },
    SendMessages {
        session: SessionId,
        messages: Vec<WireMessage>,
        disconnect: bool,
    },
    Disconnect {
        session: SessionId,
    },
    PrepareRelocation {
        key: RelocationKey,
        session: SessionId,
        identity: Identity,
        source: NodeId,
    },
    CancelRelocation {
        key: RelocationKey,
    },
    CompleteRelocation {
        session: SessionId,
        key: RelocationKey,
        target: NodeId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum RpcResponse {
    Bool {
        value: bool,
    },
    Held {
        messages: Vec<WireMessage>,
        disconnect: bool,
    },
    Ok,
    Error {
        message: String,
    },
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await
}

/// Returns `None` if the peer closed between frames.
async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let len = match stream.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_RPC_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("rpc frame of {len} bytes exceeds {MAX_RPC_FRAME}"),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accepts peer connections until the task is aborted.
pub(crate) async fn serve(listener: TcpListener, core: Arc<NodeCore>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(node = %core.node_id, %peer, "rpc peer connected");
                let core = Arc::clone(&core);
                tokio::spawn(serve_peer(stream, core));
            }
            Err(e) => {
                tracing::warn!(node = %core.node_id, error = %e, "rpc accept failed");
            }
        }
    }
}

async fn serve_peer(mut stream: TcpStream, core: Arc<NodeCore>) {
    let _ = stream.set_nodelay(true);
    let codec = JsonCodec;
    loop {
        let payload = match read_frame(&mut stream).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(node = %core.node_id, error = %e, "rpc read failed");
                break;
            }
        };
        let response = match codec.decode::<RpcRequest>(&payload) {
            Ok(request) => dispatch(&core, request).await,
            Err(e) => RpcResponse::Error {
                message: e.to_string(),
            },
        };
        let encoded = match codec.encode(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(node = %core.node_id, error = %e, "cannot encode rpc response");
                break;
            }
        };
        if let Err(e) = write_frame(&mut stream, &encoded).await {
            tracing::debug!(node = %core.node_id, error = %e, "rpc write failed");
            break;
        }
    }
}

async fn dispatch(core: &Arc<NodeCore>, request: RpcRequest) -> RpcResponse {
    tracing::trace!(node = %core.node_id, ?request, "rpc request");
    match request {
        RpcRequest::IsConnected { session } => {
            if let Some(handle) = core.handle(&session) {
                return RpcResponse::Bool {
                    value: handle.is_connected(),
                };
            }
            let moved = core.directory().moved_to(&session);
            match moved {
                Some(node) => answer_bool(core.forwarder.is_connected(node, session).await),
                None => RpcResponse::Bool { value: false },
            }
        }
        RpcRequest::SendMessage { session, message } => {
            let mut update = Update::default();
            update.push_back(message.into());
            RpcResponse::Bool {
                value: core.deliver_local(session, update).await.is_ok(),
            }
        }
        RpcRequest::SendMessages {
            session,
            messages,
            disconnect,
        } => {
            let mut update = Update::default();
            for message in messages {
                update.push_back(message.into());
            }
            if disconnect {
                update.request_disconnect();
            }
            RpcResponse::Bool {
                value: core.deliver_local(session, update).await.is_ok(),
            }
        }
        RpcRequest::Disconnect { session } => {
            let Some(handle) = core.handle(&session) else {
                let moved = core.directory().moved_to(&session);
                return match moved {
                    Some(node) => answer_bool(core.forwarder.disconnect(node, session).await),
                    None => RpcResponse::Bool { value: false },
                };
            };
            if !handle.disconnect() {
                core.session_ended(session, false);
            }
            RpcResponse::Bool { value: true }
        }
        RpcRequest::PrepareRelocation {
            key,
            session,
            identity,
            source,
        } => match core.prepare_relocation(key, session, identity, source) {
            Ok(()) => RpcResponse::Ok,
            Err(e) => RpcResponse::Error {
                message: e.to_string(),
            },
        },
        RpcRequest::CancelRelocation { key } => RpcResponse::Bool {
            value: core.cancel_relocation(&key),
        },
        RpcRequest::CompleteRelocation {
            session,
            key,
            target,
        } => match core.complete_relocation(session, key, target) {
            Ok((held, disconnect)) => RpcResponse::Held {
                messages: held.into_iter().map(WireMessage::from).collect(),
                disconnect,
            },
            Err(e) => RpcResponse::Error {
                message: e.to_string(),
            },
        },
    }
}

fn answer_bool(result: Result<bool, ForwardError>) -> RpcResponse {
    match result {
        Ok(value) => RpcResponse::Bool { value },
        Err(e) => RpcResponse::Error {
            message: e.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Call {
    request: RpcRequest,
    reply: oneshot::Sender<Result<RpcResponse, ForwardError>>,
}

/// Sends session traffic and relocation requests to other nodes.
pub(crate) struct RemoteForwarder {
    cluster: Arc<dyn ClusterMap>,
    clients: Mutex<HashMap<NodeId, mpsc::UnboundedSender<Call>>>,
}

impl RemoteForwarder {
    pub(crate) fn new(cluster: Arc<dyn ClusterMap>) -> Self {
        Self {
            cluster,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, node: NodeId) -> mpsc::UnboundedSender<Call> {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        clients
            .entry(node)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_client(node, Arc::clone(&self.cluster), rx));
                tx
            })
            .clone()
    }

    async fn call(&self, node: NodeId, request: RpcRequest) -> Result<RpcResponse, ForwardError> {
        let (reply, rx) = oneshot::channel();
        let not_running = || ForwardError::Io {
            node,
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "rpc client stopped"),
        };
        self.client(node)
            .send(Call { request, reply })
            .map_err(|_| not_running())?;
        match rx.await.map_err(|_| not_running())?? {
            RpcResponse::Error { message } => Err(ForwardError::Remote { node, message }),
            response => Ok(response),
        }
    }

    async fn call_bool(&self, node: NodeId, request: RpcRequest) -> Result<bool, ForwardError> {
        match self.call(node, request).await? {
            RpcResponse::Bool { value } => Ok(value),
            _ => Err(ForwardError::UnexpectedResponse(node)),
        }
    }

    pub(crate) async fn is_connected(
        &self,
        node: NodeId,
        session: SessionId,
    ) -> Result<bool, ForwardError> {
        self.call_bool(node, RpcRequest::IsConnected { session }).await
    }

    /// Delivers a flushed update to the node holding `session`. Returns
    /// `false` if that node no longer has the session.
    pub(crate) async fn send_messages(
        &self,
        node: NodeId,
        session: SessionId,
        update: Update,
    ) -> Result<bool, ForwardError> {
        let (mut messages, disconnect) = update.into_parts();
        let request = if messages.len() == 1 && !disconnect {
            let message = messages.remove(0).into();
            RpcRequest::SendMessage { session, message }
        } else {
            RpcRequest::SendMessages {
                session,
                messages: messages.into_iter().map(WireMessage::from).collect(),
                disconnect,
            }
        };
        self.call_bool(node, request).await
    }

    pub(crate) async fn disconnect(
        &self,
        node: NodeId,
        session: SessionId,
    ) -> Result<bool, ForwardError> {
        self.call_bool(node, RpcRequest::Disconnect { session }).await
    }

    pub(crate) async fn prepare_relocation(
        &self,
        node: NodeId,
        key: RelocationKey,
        session: SessionId,
        identity: Identity,
        source: NodeId,
    ) -> Result<(), ForwardError> {
        let request = RpcRequest::PrepareRelocation {
            key,
            session,
            identity,
            source,
        };
        match self.call(node, request).await? {
            RpcResponse::Ok => Ok(()),
            _ => Err(ForwardError::UnexpectedResponse(node)),
        }
    }

    /// Withdraws a reservation made with
    /// [`prepare_relocation`](Self::prepare_relocation).
    pub(crate) async fn cancel_relocation(
        &self,
        node: NodeId,
        key: RelocationKey,
    ) -> Result<bool, ForwardError> {
        self.call_bool(node, RpcRequest::CancelRelocation { key }).await
    }

    /// Asks the source `node` to give up `session`. Returns the messages it
    /// held and whether a disconnect was requested meanwhile.
    pub(crate) async fn complete_relocation(
        &self,
        node: NodeId,
        session: SessionId,
        key: RelocationKey,
        target: NodeId,
    ) -> Result<(Vec<OutboundMessage>, bool), ForwardError> {
        let request = RpcRequest::CompleteRelocation {
            session,
            key,
            target,
        };
        match self.call(node, request).await? {
            RpcResponse::Held {
                messages,
                disconnect,
            } => Ok((
                messages.into_iter().map(OutboundMessage::from).collect(),
                disconnect,
            )),
            _ => Err(ForwardError::UnexpectedResponse(node)),
        }
    }
}

async fn run_client(
    node: NodeId,
    cluster: Arc<dyn ClusterMap>,
    mut rx: mpsc::UnboundedReceiver<Call>,
) {
    let codec = JsonCodec;
    let mut stream: Option<TcpStream> = None;
    while let Some(call) = rx.recv().await {
        let result = exchange(node, cluster.as_ref(), &codec, &mut stream, &call.request).await;
        if let Err(e) = &result {
            tracing::debug!(%node, error = %e, "rpc call failed");
        }
        let _ = call.reply.send(result);
    }
}

async fn exchange(
    node: NodeId,
    cluster: &dyn ClusterMap,
    codec: &JsonCodec,
    stream: &mut Option<TcpStream>,
    request: &RpcRequest,
) -> Result<RpcResponse, ForwardError> {
    let payload = codec.encode(request)?;
    if payload.len() > MAX_RPC_FRAME {
        return Err(ForwardError::FrameTooLarge(payload.len()));
    }
    if stream.is_none() {
        let addr = cluster
            .rpc_addr(node)
            .ok_or(ForwardError::UnknownNode(node))?;
        let connected = TcpStream::connect(addr)
            .await
            .map_err(|source| ForwardError::Io { node, source })?;
        let _ = connected.set_nodelay(true);
        tracing::debug!(%node, %addr, "rpc client connected");
        *stream = Some(connected);
    }
    let conn = stream.as_mut().ok_or(ForwardError::UnknownNode(node))?;

    let answer = match write_frame(conn, &payload).await {
        Ok(()) => read_frame(conn).await,
        Err(e) => Err(e),
    };
    let bytes = match answer {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            *stream = None;
            return Err(ForwardError::Io {
                node,
                source: std::io::ErrorKind::UnexpectedEof.into(),
            });
        }
        Err(source) => {
            *stream = None;
            return Err(ForwardError::Io { node, source });
        }
    };
    Ok(codec.decode(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_request_is_tagged_by_op() {
        let request = RpcRequest::Disconnect {
            session: SessionId::new(NodeId(1), 9),
        };
        let json = serde_json::to_value(&request).expect("encode");
        assert_eq!(json["op"], "disconnect");
    }

    #[test]
    fn test_wire_message_converts_both_ways() {
        let message = OutboundMessage {
            body: bytes::Bytes::from_static(b"\x30hi"),
            delivery: Delivery::Reliable,
        };
        let wire = WireMessage::from(message.clone());
        assert_eq!(wire.body, b"\x30hi".to_vec());
        assert_eq!(OutboundMessage::from(wire), message);
    }

    #[tokio::test]
    async fn test_call_to_unknown_node_fails_without_route() {
        let cluster: Arc<dyn ClusterMap> = Arc::new(crate::cluster::InMemoryCluster::new());
        let forwarder = RemoteForwarder::new(cluster);
        let result = forwarder
            .is_connected(NodeId(9), SessionId::new(NodeId(1), 1))
            .await;
        assert!(matches!(result, Err(ForwardError::UnknownNode(NodeId(9)))));
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let writer = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            stream
                .write_all(&(MAX_RPC_FRAME as u32 + 1).to_be_bytes())
                .await
                .expect("write");
            stream
        });
        let (mut accepted, _) = listener.accept().await.expect("accept");
        let result = read_frame(&mut accepted).await;
        assert!(result.is_err());
        drop(writer.await.expect("writer"));
    }
}
