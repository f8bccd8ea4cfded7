//! Integration tests: real TCP clients against one or two in-process nodes
//! sharing a cluster map.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hearth::prelude::*;
use hearth_protocol::{ClientMessage, PROTOCOL_VERSION, ServerMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// =========================================================================
// Mock authenticator and listener
// =========================================================================

/// Accepts any name whose password is "secret".
struct TestAuth;

impl Authenticator for TestAuth {
    async fn authenticate(&self, name: &str, password: &str) -> Result<Identity, SessionError> {
        if password == "secret" {
            Ok(Identity::new(name))
        } else {
            Err(SessionError::AuthFailed("wrong password".into()))
        }
    }
}

/// Records disconnect callbacks.
#[derive(Clone, Default)]
struct Recorder {
    disconnects: Arc<Mutex<Vec<(SessionId, bool)>>>,
}

impl Recorder {
    fn disconnects(&self) -> Vec<(SessionId, bool)> {
        self.disconnects.lock().expect("lock").clone()
    }
}

impl SessionListener for Recorder {
    fn disconnected(&self, _ctx: &TransactionContext, session: &SessionId, graceful: bool) {
        self.disconnects
            .lock()
            .expect("lock")
            .push((*session, graceful));
    }
}

// =========================================================================
// Test helpers
// =========================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn node_config(node: u64) -> NodeConfig {
    NodeConfig {
        node_id: NodeId(node),
        bind_addr: "127.0.0.1:0".into(),
        rpc_bind_addr: "127.0.0.1:0".into(),
        public_host: "127.0.0.1".into(),
        session: SessionConfig {
            disconnect_delay: Duration::from_millis(50),
            relocation_timeout: Duration::from_secs(2),
        },
        ..NodeConfig::default()
    }
}

struct TestNode {
    addr: SocketAddr,
    service: SessionService,
}

/// Starts a node on ephemeral ports and runs it in the background.
async fn start_node(node: u64, cluster: Arc<InMemoryCluster>, listener: Recorder) -> TestNode {
    start_configured(node_config(node), cluster, listener).await
}

async fn start_configured(
    config: NodeConfig,
    cluster: Arc<InMemoryCluster>,
    listener: Recorder,
) -> TestNode {
    init_tracing();
    let server = HearthServerBuilder::new()
        .config(config)
        .cluster(cluster)
        .listener(listener)
        .build(TestAuth)
        .await
        .expect("node should start");
    let node = TestNode {
        addr: server.local_addr(),
        service: server.service(),
    };
    tokio::spawn(server.run());
    node
}

async fn single_node() -> (TestNode, Recorder) {
    let recorder = Recorder::default();
    let node = start_node(1, Arc::new(InMemoryCluster::new()), recorder.clone()).await;
    (node, recorder)
}

async fn two_nodes() -> (TestNode, TestNode, Arc<InMemoryCluster>) {
    let cluster = Arc::new(InMemoryCluster::new());
    let first = start_node(1, Arc::clone(&cluster), Recorder::default()).await;
    let second = start_node(2, Arc::clone(&cluster), Recorder::default()).await;
    (first, second, cluster)
}

async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect")
}

async fn send(stream: &mut TcpStream, msg: ClientMessage) {
    let frame = msg.frame().expect("encodable");
    stream.write_all(&frame).await.expect("write");
}

async fn recv(stream: &mut TcpStream) -> ServerMessage {
    let read = async {
        let len = stream.read_u16().await.expect("length prefix") as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.expect("frame body");
        ServerMessage::decode(Bytes::from(body)).expect("valid server message")
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("timed out waiting for server message")
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("timed out waiting for close")
        .unwrap_or(0);
    assert_eq!(n, 0, "expected the server to close the connection");
}

fn login(name: &str, password: &str) -> ClientMessage {
    ClientMessage::LoginRequest {
        version: PROTOCOL_VERSION,
        name: name.into(),
        password: password.into(),
    }
}

/// Logs `name` in and returns the connection and its session id.
async fn logged_in(node: &TestNode, name: &str) -> (TcpStream, SessionId) {
    let mut stream = connect(node.addr).await;
    send(&mut stream, login(name, "secret")).await;
    assert!(matches!(recv(&mut stream).await, ServerMessage::LoginSuccess { .. }));
    let session = node
        .service
        .sessions()
        .into_iter()
        .find(|id| node.service.identity(id).is_some_and(|i| i.name == name))
        .expect("session registered");
    (stream, session)
}

/// Drives the client side of a relocation started on `from` and returns the
/// connection to `to`. The old connection has already seen `SUSPEND_MESSAGES`.
async fn follow_relocation(old: &mut TcpStream, to: &TestNode) -> TcpStream {
    send(old, ClientMessage::SuspendMessagesComplete).await;
    let key = match recv(old).await {
        ServerMessage::RelocateNotification { key, .. } => key,
        other => panic!("expected RELOCATE_NOTIFICATION, got {other:?}"),
    };
    let mut new = connect(to.addr).await;
    send(
        &mut new,
        ClientMessage::RelocateRequest {
            version: PROTOCOL_VERSION,
            key,
        },
    )
    .await;
    assert!(matches!(recv(&mut new).await, ServerMessage::RelocateSuccess { .. }));
    new
}

fn session_message(bytes: &[u8]) -> ServerMessage {
    ServerMessage::SessionMessage {
        payload: Bytes::copy_from_slice(bytes),
    }
}

// =========================================================================
// Login and logout
// =========================================================================

#[tokio::test]
async fn test_login_success_returns_reconnect_key() {
    let (node, _recorder) = single_node().await;
    let mut stream = connect(node.addr).await;
    send(&mut stream, login("alice", "secret")).await;

    match recv(&mut stream).await {
        ServerMessage::LoginSuccess { reconnect_key } => assert_eq!(reconnect_key.len(), 16),
        other => panic!("expected LOGIN_SUCCESS, got {other:?}"),
    }
    assert_eq!(node.service.session_count(), 1);
}

#[tokio::test]
async fn test_login_wrong_password_fails_and_closes() {
    let (node, _recorder) = single_node().await;
    let mut stream = connect(node.addr).await;
    send(&mut stream, login("alice", "guess")).await;

    match recv(&mut stream).await {
        ServerMessage::LoginFailure { reason } => assert_eq!(reason, "login refused"),
        other => panic!("expected LOGIN_FAILURE, got {other:?}"),
    }
    assert_closed(&mut stream).await;
    assert_eq!(node.service.session_count(), 0);
}

#[tokio::test]
async fn test_logout_acknowledges_then_closes_gracefully() {
    let (node, recorder) = single_node().await;
    let (mut stream, session) = logged_in(&node, "alice").await;

    send(&mut stream, ClientMessage::LogoutRequest).await;
    assert_eq!(recv(&mut stream).await, ServerMessage::LogoutSuccess);
    assert_closed(&mut stream).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.disconnects(), vec![(session, true)]);
    assert_eq!(node.service.session_count(), 0);
}

#[tokio::test]
async fn test_client_drop_reports_ungraceful_disconnect() {
    let (node, recorder) = single_node().await;
    let (stream, session) = logged_in(&node, "alice").await;

    drop(stream);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(recorder.disconnects(), vec![(session, false)]);
    assert!(!node.service.is_connected(&session).await.expect("query"));
}

// =========================================================================
// Protocol violations
// =========================================================================

#[tokio::test]
async fn test_unknown_opcode_closes_connection() {
    let (node, _recorder) = single_node().await;
    let mut stream = connect(node.addr).await;

    stream.write_all(&[0x00, 0x01, 0xEE]).await.expect("write");
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_version_mismatch_closes_connection() {
    let (node, _recorder) = single_node().await;
    let mut stream = connect(node.addr).await;

    send(
        &mut stream,
        ClientMessage::LoginRequest {
            version: PROTOCOL_VERSION + 1,
            name: "alice".into(),
            password: "secret".into(),
        },
    )
    .await;
    assert_closed(&mut stream).await;
    assert_eq!(node.service.session_count(), 0);
}

// =========================================================================
// Delivery
// =========================================================================

#[tokio::test]
async fn test_messages_arrive_in_commit_order() {
    let (node, _recorder) = single_node().await;
    let (mut stream, session) = logged_in(&node, "alice").await;

    let early = node.service.begin();
    let late = node.service.begin();
    late.send_session_message(session, Bytes::from_static(&[0x03]), Delivery::Reliable)
        .expect("queue");
    early
        .send_session_message(session, Bytes::from_static(&[0x01]), Delivery::Reliable)
        .expect("queue");
    early
        .send_session_message(session, Bytes::from_static(&[0x02]), Delivery::Reliable)
        .expect("queue");

    early.prepare_and_commit().expect("commit");
    late.prepare_and_commit().expect("commit");

    assert_eq!(recv(&mut stream).await, session_message(&[0x01]));
    assert_eq!(recv(&mut stream).await, session_message(&[0x02]));
    assert_eq!(recv(&mut stream).await, session_message(&[0x03]));
}

#[tokio::test]
async fn test_aborted_transaction_sends_nothing() {
    let (node, _recorder) = single_node().await;
    let (mut stream, session) = logged_in(&node, "alice").await;

    let aborted = node.service.begin();
    aborted
        .send_session_message(session, Bytes::from_static(b"lost"), Delivery::Reliable)
        .expect("queue");
    aborted.abort().expect("abort");

    let kept = node.service.begin();
    kept.send_session_message(session, Bytes::from_static(b"kept"), Delivery::Reliable)
        .expect("queue");
    kept.prepare_and_commit().expect("commit");

    assert_eq!(recv(&mut stream).await, session_message(b"kept"));
}

#[tokio::test]
async fn test_output_for_remote_session_is_forwarded() {
    let (first, second, _cluster) = two_nodes().await;
    let (mut stream, session) = logged_in(&first, "alice").await;

    let ctx = second.service.begin();
    ctx.send_channel_join(session, "lobby", ChannelId(9))
        .expect("queue");
    ctx.send_session_message(session, Bytes::from_static(b"hi"), Delivery::Reliable)
        .expect("queue");
    ctx.prepare_and_commit().expect("commit");

    assert_eq!(
        recv(&mut stream).await,
        ServerMessage::ChannelJoin {
            name: "lobby".into(),
            channel: ChannelId(9)
        }
    );
    assert_eq!(recv(&mut stream).await, session_message(b"hi"));
    assert!(second.service.is_connected(&session).await.expect("rpc"));
}

#[tokio::test]
async fn test_remote_disconnect_closes_client() {
    let (first, second, _cluster) = two_nodes().await;
    let (mut stream, session) = logged_in(&first, "alice").await;

    assert!(second.service.disconnect(&session).await.expect("rpc"));
    assert_closed(&mut stream).await;
}

// =========================================================================
// Redirect and relocation
// =========================================================================

#[tokio::test]
async fn test_login_for_pinned_identity_redirects() {
    let (first, second, cluster) = two_nodes().await;
    cluster.pin("bob", NodeId(2));

    let mut stream = connect(first.addr).await;
    send(&mut stream, login("bob", "secret")).await;

    match recv(&mut stream).await {
        ServerMessage::LoginRedirect { target } => {
            assert_eq!(target.host, "127.0.0.1");
            assert_eq!(target.port, second.addr.port());
        }
        other => panic!("expected LOGIN_REDIRECT, got {other:?}"),
    }
    assert_closed(&mut stream).await;
    assert_eq!(first.service.session_count(), 0);
}

#[tokio::test]
async fn test_relocation_moves_session_and_held_messages() {
    let (first, second, _cluster) = two_nodes().await;
    let (mut old, session) = logged_in(&first, "alice").await;

    first
        .service
        .relocate(&session, NodeId(2))
        .await
        .expect("relocation starts");
    assert_eq!(recv(&mut old).await, ServerMessage::SuspendMessages);

    // Produced while suspended: must not reach the old connection.
    let ctx = first.service.begin();
    ctx.send_session_message(session, Bytes::from_static(b"held"), Delivery::Reliable)
        .expect("queue");
    ctx.prepare_and_commit().expect("commit");
    tokio::time::sleep(Duration::from_millis(50)).await;

    send(&mut old, ClientMessage::SuspendMessagesComplete).await;
    let key = match recv(&mut old).await {
        ServerMessage::RelocateNotification { target, key } => {
            assert_eq!(target.port, second.addr.port());
            assert_eq!(key.len(), 16);
            key
        }
        other => panic!("expected RELOCATE_NOTIFICATION, got {other:?}"),
    };

    let mut new = connect(second.addr).await;
    send(
        &mut new,
        ClientMessage::RelocateRequest {
            version: PROTOCOL_VERSION,
            key,
        },
    )
    .await;
    assert!(matches!(recv(&mut new).await, ServerMessage::RelocateSuccess { .. }));
    assert_eq!(recv(&mut new).await, session_message(b"held"));
    assert_closed(&mut old).await;

    assert_eq!(second.service.sessions(), vec![session]);
    assert_eq!(first.service.session_count(), 0);
    assert!(first.service.is_connected(&session).await.expect("rpc"));
}

#[tokio::test]
async fn test_relocate_with_unknown_key_fails() {
    let (_first, second, _cluster) = two_nodes().await;
    let mut stream = connect(second.addr).await;

    send(
        &mut stream,
        ClientMessage::RelocateRequest {
            version: PROTOCOL_VERSION,
            key: Bytes::from_static(&[7u8; 16]),
        },
    )
    .await;
    match recv(&mut stream).await {
        ServerMessage::RelocateFailure { reason } => assert_eq!(reason, "relocation refused"),
        other => panic!("expected RELOCATE_FAILURE, got {other:?}"),
    }
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_relocate_to_own_node_is_rejected() {
    let (node, _recorder) = single_node().await;
    let (_stream, session) = logged_in(&node, "alice").await;

    let err = node
        .service
        .relocate(&session, NodeId(1))
        .await
        .expect_err("same node");
    assert!(matches!(err, HearthError::AlreadyLocal(..)));
}

#[tokio::test]
async fn test_relocate_while_relocating_fails_without_contacting_target() {
    let (first, _second, cluster) = two_nodes().await;
    cluster.register_node(
        NodeId(3),
        vec![ProtocolDescriptor::tcp("127.0.0.1", 1)],
        "127.0.0.1:1".parse().expect("addr"),
    );
    let (mut old, session) = logged_in(&first, "alice").await;

    first
        .service
        .relocate(&session, NodeId(2))
        .await
        .expect("relocation starts");
    assert_eq!(recv(&mut old).await, ServerMessage::SuspendMessages);

    let err = first
        .service
        .relocate(&session, NodeId(3))
        .await
        .expect_err("second relocation");
    assert!(
        matches!(err, HearthError::Engine(EngineError::AlreadyRelocating)),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_relocate_after_unreachable_target_can_retry() {
    let (first, second, cluster) = two_nodes().await;
    cluster.register_node(
        NodeId(3),
        vec![ProtocolDescriptor::tcp("127.0.0.1", 1)],
        "127.0.0.1:1".parse().expect("addr"),
    );
    let (mut old, session) = logged_in(&first, "alice").await;

    let err = first
        .service
        .relocate(&session, NodeId(3))
        .await
        .expect_err("unreachable target");
    assert!(matches!(err, HearthError::Forward(..)), "got {err:?}");

    // The failed attempt left the session free to suspend or move.
    first
        .service
        .relocate(&session, NodeId(2))
        .await
        .expect("retry starts");
    assert_eq!(recv(&mut old).await, ServerMessage::SuspendMessages);
    let _new = follow_relocation(&mut old, &second).await;
    assert_eq!(second.service.sessions(), vec![session]);
}

#[tokio::test]
async fn test_relocation_timeout_abandons_session() {
    let cluster = Arc::new(InMemoryCluster::new());
    let recorder = Recorder::default();
    let mut config = node_config(1);
    config.session.relocation_timeout = Duration::from_millis(200);
    let first = start_configured(config, Arc::clone(&cluster), recorder.clone()).await;
    let _second = start_node(2, Arc::clone(&cluster), Recorder::default()).await;
    let (mut old, session) = logged_in(&first, "alice").await;

    first
        .service
        .relocate(&session, NodeId(2))
        .await
        .expect("relocation starts");
    assert_eq!(recv(&mut old).await, ServerMessage::SuspendMessages);
    send(&mut old, ClientMessage::SuspendMessagesComplete).await;
    assert!(matches!(
        recv(&mut old).await,
        ServerMessage::RelocateNotification { .. }
    ));

    // The client never shows up at node 2.
    assert_closed(&mut old).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(first.service.session_count(), 0);
    assert_eq!(cluster.session_node(&session), None);
    assert_eq!(recorder.disconnects(), vec![(session, false)]);
}

#[tokio::test]
async fn test_source_follows_moved_route_after_relocation() {
    let (first, second, cluster) = two_nodes().await;
    let (mut old, session) = logged_in(&first, "alice").await;

    first
        .service
        .relocate(&session, NodeId(2))
        .await
        .expect("relocation starts");
    assert_eq!(recv(&mut old).await, ServerMessage::SuspendMessages);
    let mut new = follow_relocation(&mut old, &second).await;
    assert_eq!(cluster.session_node(&session), Some(NodeId(2)));

    // A peer whose view still names the source node.
    cluster.record_session(session, NodeId(1));
    let third = start_node(3, Arc::clone(&cluster), Recorder::default()).await;
    let ctx = third.service.begin();
    ctx.send_session_message(session, Bytes::from_static(b"late"), Delivery::Reliable)
        .expect("queue");
    ctx.prepare_and_commit().expect("commit");

    assert_eq!(recv(&mut new).await, session_message(b"late"));
    assert!(third.service.is_connected(&session).await.expect("rpc"));
    assert_eq!(cluster.session_node(&session), Some(NodeId(1)));
}

#[tokio::test]
async fn test_source_commit_after_relocation_reaches_target() {
    let (first, second, cluster) = two_nodes().await;
    let (mut old, session) = logged_in(&first, "alice").await;

    first
        .service
        .relocate(&session, NodeId(2))
        .await
        .expect("relocation starts");
    assert_eq!(recv(&mut old).await, ServerMessage::SuspendMessages);
    let mut new = follow_relocation(&mut old, &second).await;

    let ctx = first.service.begin();
    ctx.send_session_message(session, Bytes::from_static(b"after"), Delivery::Reliable)
        .expect("queue");
    ctx.prepare_and_commit().expect("commit");

    assert_eq!(recv(&mut new).await, session_message(b"after"));
    assert_eq!(cluster.session_node(&session), Some(NodeId(2)));
    assert!(first.service.is_connected(&session).await.expect("rpc"));
}

// =========================================================================
// Suspend and resume
// =========================================================================

#[tokio::test]
async fn test_suspend_holds_messages_until_resume() {
    let (node, _recorder) = single_node().await;
    let (mut stream, session) = logged_in(&node, "alice").await;

    let completion = node.service.suspend(&session).expect("suspend");
    assert_eq!(recv(&mut stream).await, ServerMessage::SuspendMessages);

    let ctx = node.service.begin();
    ctx.send_session_message(session, Bytes::from_static(b"one"), Delivery::Reliable)
        .expect("queue");
    ctx.send_session_message(session, Bytes::from_static(b"two"), Delivery::Reliable)
        .expect("queue");
    ctx.prepare_and_commit().expect("commit");

    send(&mut stream, ClientMessage::SuspendMessagesComplete).await;
    tokio::time::timeout(Duration::from_secs(5), completion.wait())
        .await
        .expect("acknowledged in time")
        .expect("acknowledged");

    node.service.resume(&session).expect("resume");
    assert_eq!(recv(&mut stream).await, ServerMessage::ResumeMessages);
    assert_eq!(recv(&mut stream).await, session_message(b"one"));
    assert_eq!(recv(&mut stream).await, session_message(b"two"));
}

#[tokio::test]
async fn test_suspend_during_relocation_is_rejected() {
    let (first, _second, _cluster) = two_nodes().await;
    let (mut old, session) = logged_in(&first, "alice").await;

    first
        .service
        .relocate(&session, NodeId(2))
        .await
        .expect("relocation starts");
    assert_eq!(recv(&mut old).await, ServerMessage::SuspendMessages);

    assert!(matches!(
        first.service.suspend(&session),
        Err(HearthError::Engine(EngineError::Relocating))
    ));
}
