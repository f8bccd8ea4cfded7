//! Integration tests for the byte-stream transports.
//!
//! These tests spin up real listeners on `127.0.0.1:0` and talk to them with
//! plain tokio clients, so the bytes really cross a socket.

#[cfg(feature = "tcp")]
mod tcp {
    use hearth_transport::{Connection, TcpTransport, Transport};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_tcp_accept_and_exchange_bytes() {
        let mut transport = TcpTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });
        let mut client = TcpStream::connect(addr).await.expect("connect");
        let conn = server.await.expect("task should complete");
        assert!(conn.id().into_inner() > 0);

        conn.send(b"hello from server").await.expect("send");
        let mut buf = [0u8; 17];
        client.read_exact(&mut buf).await.expect("client read");
        assert_eq!(&buf, b"hello from server");

        client.write_all(b"hello from client").await.expect("write");
        let mut received = Vec::new();
        while received.len() < 17 {
            let chunk = conn.recv().await.expect("recv").expect("data");
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"hello from client");
    }

    #[tokio::test]
    async fn test_tcp_recv_returns_none_on_client_close() {
        let mut transport = TcpTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });
        let client = TcpStream::connect(addr).await.expect("connect");
        let conn = server.await.expect("task should complete");

        drop(client);
        let result = conn.recv().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on client close");
    }

    #[tokio::test]
    async fn test_tcp_bind_failure_reports_address() {
        let first = TcpTransport::bind("127.0.0.1:0").await.expect("bind");
        let taken = first.local_addr().expect("addr").to_string();
        match TcpTransport::bind(&taken).await {
            Err(e) => assert!(e.to_string().contains(&taken)),
            Ok(_) => panic!("second bind on {taken} should fail"),
        }
    }
}

#[cfg(feature = "websocket")]
mod websocket {
    use futures_util::{SinkExt, StreamExt};
    use hearth_transport::{Connection, Transport, WebSocketTransport};
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn test_websocket_accept_and_send_receive() {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });
        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("client should connect");
        let conn = server.await.expect("task should complete");

        conn.send(b"\x00\x01\x30").await.expect("send");
        let msg = client.next().await.expect("frame").expect("ok");
        assert_eq!(msg.into_data().as_ref(), b"\x00\x01\x30");

        client
            .send(Message::Binary(b"\x00\x01\x40".to_vec().into()))
            .await
            .expect("client send");
        let received = conn.recv().await.expect("recv").expect("data");
        assert_eq!(received, b"\x00\x01\x40");

        conn.close().await.expect("close should succeed");
    }

    #[tokio::test]
    async fn test_websocket_recv_returns_none_on_client_close() {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("local addr");

        let server = tokio::spawn(async move {
            transport.accept().await.expect("should accept")
        });
        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .expect("client should connect");
        let conn = server.await.expect("task should complete");

        client.send(Message::Close(None)).await.expect("close");
        let result = conn.recv().await.expect("recv should not error");
        assert!(result.is_none(), "should return None on client close");
    }
}
