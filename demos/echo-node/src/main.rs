use hearth::prelude::*;

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Sends every session and channel message straight back to its sender.
struct Echo;

impl SessionListener for Echo {
    fn logged_in(
        &self,
        ctx: &TransactionContext,
        session: &SessionId,
        identity: &Identity,
    ) -> Result<(), LoginError> {
        let greeting = format!("welcome, {}", identity.name);
        ctx.send_session_message(*session, Bytes::from(greeting), Delivery::Reliable)
            .map_err(|e| LoginError::Refused(e.to_string()))
    }

    fn received_message(&self, ctx: &TransactionContext, session: &SessionId, payload: Bytes) {
        if let Err(e) = ctx.send_session_message(*session, payload, Delivery::Reliable) {
            tracing::warn!(session_id = %session, error = %e, "echo dropped");
        }
    }

    fn received_channel_message(
        &self,
        ctx: &TransactionContext,
        session: &SessionId,
        channel: ChannelId,
        payload: Bytes,
    ) {
        if let Err(e) = ctx.send_channel_message(*session, channel, payload, Delivery::Reliable) {
            tracing::warn!(session_id = %session, %channel, error = %e, "channel echo dropped");
        }
    }

    fn disconnected(&self, _ctx: &TransactionContext, session: &SessionId, graceful: bool) {
        tracing::info!(session_id = %session, graceful, "client left");
    }
}

/// Lets in anyone with a non-empty name.
struct NameOnly;

impl Authenticator for NameOnly {
    async fn authenticate(&self, name: &str, _password: &str) -> Result<Identity, SessionError> {
        if name.is_empty() {
            return Err(SessionError::AuthFailed("empty name".into()));
        }
        Ok(Identity::new(name))
    }
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };

    let server = HearthServerBuilder::new()
        .config(config)
        .listener(Echo)
        .build(NameOnly)
        .await?;
    tracing::info!(addr = %server.local_addr(), "echo node listening");

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_protocol::{ClientMessage, PROTOCOL_VERSION, ServerMessage};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start() -> std::net::SocketAddr {
        let config = NodeConfig {
            bind_addr: "127.0.0.1:0".into(),
            rpc_bind_addr: "127.0.0.1:0".into(),
            ..NodeConfig::default()
        };
        let server = HearthServerBuilder::new()
            .config(config)
            .listener(Echo)
            .build(NameOnly)
            .await
            .unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run());
        addr
    }

    async fn send(stream: &mut TcpStream, msg: ClientMessage) {
        stream.write_all(&msg.frame().unwrap()).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream) -> ServerMessage {
        let read = async {
            let len = stream.read_u16().await.unwrap() as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await.unwrap();
            ServerMessage::decode(Bytes::from(body)).unwrap()
        };
        tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_echo_greets_then_echoes() {
        let addr = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(
            &mut stream,
            ClientMessage::LoginRequest {
                version: PROTOCOL_VERSION,
                name: "ada".into(),
                password: String::new(),
            },
        )
        .await;

        assert!(matches!(recv(&mut stream).await, ServerMessage::LoginSuccess { .. }));
        assert_eq!(
            recv(&mut stream).await,
            ServerMessage::SessionMessage {
                payload: Bytes::from_static(b"welcome, ada")
            }
        );

        send(
            &mut stream,
            ClientMessage::ChannelMessage {
                channel: ChannelId(3),
                payload: Bytes::from_static(b"ping"),
            },
        )
        .await;
        assert_eq!(
            recv(&mut stream).await,
            ServerMessage::ChannelMessage {
                channel: ChannelId(3),
                payload: Bytes::from_static(b"ping")
            }
        );
    }
}
