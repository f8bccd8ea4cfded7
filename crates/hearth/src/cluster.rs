//! The node-mapping collaborator.
//!
//! Hearth does not discover nodes or detect failures. It asks a
//! [`ClusterMap`] where identities belong, which node holds a session, and
//! how to reach a node. [`InMemoryCluster`] serves single-process clusters
//! and tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use hearth_protocol::ProtocolDescriptor;
use hearth_session::{Identity, NodeId, SessionId};

/// Cluster-wide lookups the session layer depends on.
///
/// Methods are synchronous and must not block; a networked implementation
/// is expected to answer from a local cache.
pub trait ClusterMap: Send + Sync + 'static {
    /// Announces a node and how clients and peers reach it.
    fn register_node(&self, node: NodeId, descriptors: Vec<ProtocolDescriptor>, rpc_addr: SocketAddr);

    /// The node that should host `identity`, given the login arrived at
    /// `local`.
    fn assign(&self, identity: &Identity, local: NodeId) -> NodeId;

    /// Client-facing acceptors of `node`.
    fn descriptors(&self, node: NodeId) -> Option<Vec<ProtocolDescriptor>>;

    /// Session server address of `node`.
    fn rpc_addr(&self, node: NodeId) -> Option<SocketAddr>;

    /// The node currently holding `session`.
    fn session_node(&self, session: &SessionId) -> Option<NodeId>;

    fn record_session(&self, session: SessionId, node: NodeId);

    fn remove_session(&self, session: &SessionId);

    /// `node` reported `session` as no longer connected. The record is only
    /// dropped if it still names `node`.
    fn mark_disconnected(&self, session: &SessionId, node: NodeId) {
        if self.session_node(session) == Some(node) {
            self.remove_session(session);
        }
    }
}

#[derive(Debug)]
struct NodeEntry {
    descriptors: Vec<ProtocolDescriptor>,
    rpc_addr: SocketAddr,
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: HashMap<NodeId, NodeEntry>,
    pinned: HashMap<String, NodeId>,
    sessions: HashMap<SessionId, NodeId>,
}

/// A [`ClusterMap`] kept in process memory, shared by every node built from
/// the same `Arc`.
///
/// Identities are hosted where they log in unless [`pin`](Self::pin)ned to
/// a node.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces logins of `name` onto `node`.
    pub fn pin(&self, name: impl Into<String>, node: NodeId) {
        if let Ok(mut state) = self.state.write() {
            state.pinned.insert(name.into(), node);
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.read().map(|s| s.sessions.len()).unwrap_or(0)
    }
}

impl ClusterMap for InMemoryCluster {
    fn register_node(&self, node: NodeId, descriptors: Vec<ProtocolDescriptor>, rpc_addr: SocketAddr) {
        if let Ok(mut state) = self.state.write() {
            tracing::debug!(%node, %rpc_addr, "node registered");
            state.nodes.insert(node, NodeEntry { descriptors, rpc_addr });
        }
    }

    fn assign(&self, identity: &Identity, local: NodeId) -> NodeId {
        self.state
            .read()
            .ok()
            .and_then(|state| state.pinned.get(&identity.name).copied())
            .unwrap_or(local)
    }

    fn descriptors(&self, node: NodeId) -> Option<Vec<ProtocolDescriptor>> {
        let state = self.state.read().ok()?;
        state.nodes.get(&node).map(|entry| entry.descriptors.clone())
    }

    fn rpc_addr(&self, node: NodeId) -> Option<SocketAddr> {
        let state = self.state.read().ok()?;
        state.nodes.get(&node).map(|entry| entry.rpc_addr)
    }

    fn session_node(&self, session: &SessionId) -> Option<NodeId> {
        let state = self.state.read().ok()?;
        state.sessions.get(session).copied()
    }

    fn record_session(&self, session: SessionId, node: NodeId) {
        if let Ok(mut state) = self.state.write() {
            state.sessions.insert(session, node);
        }
    }

    fn remove_session(&self, session: &SessionId) {
        if let Ok(mut state) = self.state.write() {
            state.sessions.remove(session);
        }
    }

    fn mark_disconnected(&self, session: &SessionId, node: NodeId) {
        if let Ok(mut state) = self.state.write() {
            if state.sessions.get(session) == Some(&node) {
                state.sessions.remove(session);
            }
        }
    }
}
