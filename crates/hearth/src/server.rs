//! `HearthServer` builder and accept loop.
//!
//! This is the entry point for running a Hearth node. It ties together all
//! the layers: transport → protocol → engine → session service → delivery.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hearth_protocol::{MessageChannel, ProtocolDescriptor, TransportKind};
use hearth_session::{Authenticator, NodeId};
use hearth_transport::{Connection, TcpTransport, Transport, TransportError};
#[cfg(feature = "websocket")]
use hearth_transport::WebSocketTransport;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::cluster::{ClusterMap, InMemoryCluster};
use crate::config::NodeConfig;
use crate::engine::{EngineSettings, SessionProtocol, run_connection};
use crate::service::{NodeCore, NodeState, NoopListener, SessionListener, SessionService};
use crate::{HearthError, forward};

/// A [`Transport`] clients can reach a node through.
///
/// The kind ends up in the node's [`ProtocolDescriptor`], which decides where
/// redirects and relocations can send the node's clients.
pub trait ClientTransport:
    Transport<Error = TransportError, Connection: Connection<Error = TransportError>>
{
    fn kind(&self) -> TransportKind;
}

impl ClientTransport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

#[cfg(feature = "websocket")]
impl ClientTransport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }
}

/// Builder for configuring and starting a Hearth node.
///
/// # Example
///
/// ```rust,ignore
/// use hearth::prelude::*;
///
/// let server = HearthServerBuilder::new()
///     .config(NodeConfig::from_file("node.json")?)
///     .listener(MyGame::default())
///     .build(my_auth)
///     .await?;
/// server.run().await
/// ```
pub struct HearthServerBuilder {
    config: NodeConfig,
    cluster: Option<Arc<dyn ClusterMap>>,
    listener: Arc<dyn SessionListener>,
}

impl HearthServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            cluster: None,
            listener: Arc::new(NoopListener),
        }
    }

    /// Sets the node configuration. It is normalized with
    /// [`NodeConfig::validated`].
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config.validated();
        self
    }

    /// Shares a cluster map with other nodes. Without one the node gets a
    /// private [`InMemoryCluster`].
    pub fn cluster(mut self, cluster: Arc<dyn ClusterMap>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Sets the application callbacks.
    pub fn listener(mut self, listener: impl SessionListener) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    /// Binds the client and node-to-node listeners and starts the node's
    /// background tasks. Clients connect over plain TCP.
    pub async fn build<A: Authenticator>(self, auth: A) -> Result<HearthServer<A>, HearthError> {
        let transport =
            TcpTransport::bind_with_buffer(&self.config.bind_addr, self.config.read_buffer_size)
                .await?;
        self.build_on(auth, transport).await
    }

    /// Like [`build`](Self::build), but clients connect through an already
    /// bound `transport`; `bind_addr` is ignored.
    pub async fn build_on<A, T>(
        self,
        auth: A,
        transport: T,
    ) -> Result<HearthServer<A, T>, HearthError>
    where
        A: Authenticator,
        T: ClientTransport,
    {
        let config = self.config;
        let local_addr = transport.local_addr()?;
        let rpc_listener = TcpListener::bind(&config.rpc_bind_addr)
            .await
            .map_err(|source| TransportError::BindFailed {
                addr: config.rpc_bind_addr.clone(),
                source,
            })?;
        let rpc_addr = rpc_listener
            .local_addr()
            .map_err(|source| TransportError::BindFailed {
                addr: config.rpc_bind_addr.clone(),
                source,
            })?;

        let descriptor = ProtocolDescriptor {
            transport: transport.kind(),
            host: config.public_host.clone(),
            port: local_addr.port(),
        };
        let cluster = self
            .cluster
            .unwrap_or_else(|| Arc::new(InMemoryCluster::new()) as Arc<dyn ClusterMap>);
        cluster.register_node(config.node_id, vec![descriptor.clone()], rpc_addr);

        let settings = EngineSettings {
            disconnect_delay: config.session.disconnect_delay,
            relocation_timeout: config.session.relocation_timeout,
            local: descriptor,
        };
        let read_buffer_size = config.read_buffer_size;
        let core = NodeCore::new(config, cluster, self.listener);

        let tasks = vec![
            core.pipeline.spawn_flusher(Arc::clone(&core)),
            tokio::spawn(forward::serve(rpc_listener, Arc::clone(&core))),
            core.spawn_sweeper(),
        ];
        tracing::info!(node = %core.node_id, %local_addr, %rpc_addr, "node started");

        Ok(HearthServer {
            transport,
            state: Arc::new(NodeState { core, auth }),
            settings,
            read_buffer_size,
            local_addr,
            rpc_addr,
            tasks,
        })
    }
}

impl Default for HearthServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound Hearth node.
///
/// Call [`run()`](Self::run) to start accepting client connections.
pub struct HearthServer<A: Authenticator, T: ClientTransport = TcpTransport> {
    transport: T,
    state: Arc<NodeState<A>>,
    settings: EngineSettings,
    read_buffer_size: usize,
    local_addr: SocketAddr,
    rpc_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl<A: Authenticator, T: ClientTransport> HearthServer<A, T> {
    pub fn node_id(&self) -> NodeId {
        self.state.core.node_id
    }

    /// Where clients connect.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Where other nodes connect.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// The application-facing session API of this node.
    pub fn service(&self) -> SessionService {
        SessionService {
            core: Arc::clone(&self.state.core),
        }
    }

    /// Runs the accept loop until the transport fails.
    pub async fn run(self) -> Result<(), HearthError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop until `shutdown` resolves, then closes every
    /// session and stops the node's background tasks.
    pub async fn run_until(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), HearthError> {
        tracing::info!(node = %self.state.core.node_id, "hearth node running");
        let result = tokio::select! {
            result = accept_loop(
                &mut self.transport,
                &self.state,
                &self.settings,
                self.read_buffer_size,
            ) => result,
            () = shutdown => Ok(()),
        };
        self.stop().await;
        result
    }

    async fn stop(&self) {
        tracing::info!(node = %self.state.core.node_id, "hearth node stopping");
        self.state.core.shutdown();
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = self.transport.shutdown().await {
            tracing::debug!(error = %e, "transport shutdown failed");
        }
    }
}

async fn accept_loop<A: Authenticator, T: ClientTransport>(
    transport: &mut T,
    state: &Arc<NodeState<A>>,
    settings: &EngineSettings,
    read_buffer_size: usize,
) -> Result<(), HearthError> {
    loop {
        match transport.accept().await {
            Ok(conn) => {
                let channel = match MessageChannel::new(conn, read_buffer_size) {
                    Ok(channel) => Arc::new(channel),
                    Err(e) => {
                        tracing::error!(error = %e, "cannot set up connection");
                        continue;
                    }
                };
                let protocol = SessionProtocol::start(Arc::clone(&channel), settings.clone());
                tokio::spawn(run_connection(channel, protocol, Arc::clone(state)));
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "transport failed");
                return Err(e.into());
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
            }
        }
    }
}
