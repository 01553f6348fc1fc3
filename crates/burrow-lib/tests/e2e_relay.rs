//! End-to-end relay scenarios
//!
//! Each test boots a full relay on ephemeral ports with an in-memory
//! repository, drives it with a minimal protocol-speaking client, and hits
//! the public ingress the way an internet caller would.

use burrow_lib::{Client, InMemoryRepository, Relay, RelayConfig, RelayHandle, Repository};
use burrow_mux::{MuxSession, MuxStream};
use burrow_proto::{
    AuthRequest, ControlMessage, ErrorPayload, MessageType, MuxEstablish, TunnelAccepted,
    TunnelProtocol, TunnelRequest,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_relay(configure: impl FnOnce(&mut RelayConfig)) -> (RelayHandle, Arc<InMemoryRepository>) {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init()
        .ok();

    let repo = Arc::new(InMemoryRepository::new());
    repo.insert_client(Client {
        id: "client-1".to_string(),
        name: "first".to_string(),
        api_token: "T".to_string(),
        max_tunnels: 5,
        allowed_subdomains: Vec::new(),
        status: "active".to_string(),
    });
    repo.insert_client(Client {
        id: "client-2".to_string(),
        name: "second".to_string(),
        api_token: "T2".to_string(),
        max_tunnels: 5,
        allowed_subdomains: Vec::new(),
        status: "active".to_string(),
    });

    let mut config = RelayConfig::new("example.test");
    config.control_port = 0;
    config.http_port = 0;
    configure(&mut config);

    let handle = Relay::start(config, repo.clone()).await.expect("relay starts");
    (handle, repo)
}

/// Minimal tunnel client speaking the control protocol over WebSocket.
struct TestClient {
    ws: Ws,
}

impl TestClient {
    async fn connect(control_addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{}", control_addr.port()))
            .await
            .expect("control connection");
        Self { ws }
    }

    async fn send(&mut self, msg: ControlMessage) {
        self.ws
            .send(Message::Text(msg.encode().unwrap()))
            .await
            .expect("control send");
    }

    async fn recv(&mut self) -> ControlMessage {
        loop {
            let frame = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("control message within deadline")
                .expect("control connection open")
                .expect("control read");
            match frame {
                Message::Text(text) => return ControlMessage::decode(&text).expect("valid message"),
                Message::Close(_) => panic!("control connection closed"),
                _ => continue,
            }
        }
    }

    async fn authenticate(&mut self, token: &str) -> ControlMessage {
        let msg = AuthRequest {
            token: token.to_string(),
        }
        .into_message(Uuid::new_v4().to_string());
        self.send(msg).await;
        self.recv().await
    }

    async fn request_tunnel(&mut self, subdomain: &str, protocol: TunnelProtocol) -> ControlMessage {
        let msg = TunnelRequest {
            subdomain: subdomain.to_string(),
            protocol,
            local_port: 3000,
            local_host: "localhost".to_string(),
            public_port: None,
            services: Vec::new(),
            max_streams: None,
        }
        .into_message(Uuid::new_v4().to_string());
        self.send(msg).await;
        self.recv().await
    }

    async fn open_http_tunnel(&mut self, subdomain: &str) -> TunnelAccepted {
        let response = self.request_tunnel(subdomain, TunnelProtocol::Http).await;
        assert_eq!(response.msg_type, MessageType::TunnelResponse, "got {response:?}");
        TunnelAccepted::from_payload(&response.payload).unwrap()
    }

    /// Consume the `new_connection` message, dial the mux listener, and
    /// serve accepted streams with `handler`.
    async fn attach_mux<F, Fut>(&mut self, handler: F) -> Arc<MuxSession>
    where
        F: Fn(MuxStream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let msg = self.recv().await;
        assert_eq!(msg.msg_type, MessageType::NewConnection, "got {msg:?}");
        let establish = MuxEstablish::from_payload(&msg.payload).unwrap();

        let socket = TcpStream::connect(("127.0.0.1", establish.mux_port))
            .await
            .expect("dial mux listener");
        let session = Arc::new(MuxSession::client(socket));

        let accept_session = session.clone();
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            while let Some(stream) = accept_session.accept().await {
                let handler = handler.clone();
                tokio::spawn(async move { handler(stream).await });
            }
        });

        session
    }
}

/// Local service stand-in: one fixed HTTP response per stream.
async fn hello_responder(mut stream: MuxStream) {
    let mut buf = vec![0u8; 4096];
    let _ = stream.read(&mut buf).await;
    let _ = stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
        .await;
    let _ = stream.flush().await;
}

/// Local service stand-in: server-sent events, one every 400 ms.
async fn sse_responder(mut stream: MuxStream) {
    let mut buf = vec![0u8; 4096];
    let _ = stream.read(&mut buf).await;
    stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n")
        .await
        .unwrap();
    stream.flush().await.unwrap();
    for i in 0..3 {
        sleep(Duration::from_millis(400)).await;
        stream
            .write_all(format!("data: event-{i}\n\n").as_bytes())
            .await
            .unwrap();
        stream.flush().await.unwrap();
    }
}

/// Local service stand-in: byte echo for raw TCP tunnels.
async fn echo_responder(mut stream: MuxStream) {
    let mut buf = vec![0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                let _ = stream.flush().await;
            }
        }
    }
}

async fn http_get(addr: SocketAddr, host: &str, path: &str) -> Vec<u8> {
    let mut socket = TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .expect("connect ingress");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\n\r\n");
    socket.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    socket.read_to_end(&mut response).await.unwrap();
    response
}

async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(25)).await;
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_http_happy_path() {
    let (relay, repo) = start_relay(|_| {}).await;

    let mut client = TestClient::connect(relay.control_addr).await;
    let auth = client.authenticate("T").await;
    assert_eq!(auth.msg_type, MessageType::AuthResponse);
    let granted = burrow_proto::AuthResponse::from_payload(&auth.payload).unwrap();
    assert!(granted.success);
    assert_eq!(granted.client_id.as_deref(), Some("client-1"));

    let accepted = client.open_http_tunnel("myapp").await;
    assert_eq!(accepted.public_url.as_deref(), Some("https://myapp.example.test"));
    let _session = client.attach_mux(hello_responder).await;

    let response = http_get(relay.http_addr, "myapp.example.test", "/hello").await;
    assert_eq!(&response, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");

    // The repository row and the binding agree.
    let row = repo.get_tunnel_by_subdomain("myapp").await.unwrap().unwrap();
    assert_eq!(row.id, accepted.tunnel_id);
    assert_eq!(relay.registry.count(), 1);

    // The exchange was recorded.
    wait_for(|| !repo.connection_logs().is_empty(), "connection log").await;
    let logs = repo.connection_logs();
    assert_eq!(logs[0].request_method.as_deref(), Some("GET"));
    assert_eq!(logs[0].request_path.as_deref(), Some("/hello"));
    assert_eq!(logs[0].response_status, Some(200));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subdomain_collision() {
    let (relay, _repo) = start_relay(|_| {}).await;

    let mut first = TestClient::connect(relay.control_addr).await;
    first.authenticate("T").await;
    first.open_http_tunnel("myapp").await;
    let _session = first.attach_mux(hello_responder).await;

    let mut second = TestClient::connect(relay.control_addr).await;
    second.authenticate("T2").await;
    let response = second.request_tunnel("myapp", TunnelProtocol::Http).await;
    assert_eq!(response.msg_type, MessageType::Error);
    let payload = ErrorPayload::from_payload(&response.payload).unwrap();
    assert_eq!(payload.code, "SUBDOMAIN_TAKEN");

    assert_eq!(relay.registry.count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auth_boundaries() {
    let (relay, _repo) = start_relay(|_| {}).await;

    // Missing token field.
    let mut client = TestClient::connect(relay.control_addr).await;
    let msg = ControlMessage::new(MessageType::Auth, "req-1", Default::default());
    client.send(msg).await;
    let response = client.recv().await;
    let payload = ErrorPayload::from_payload(&response.payload).unwrap();
    assert_eq!(payload.code, "INVALID_TOKEN");

    // Unknown token.
    let mut client = TestClient::connect(relay.control_addr).await;
    let response = client.authenticate("nope").await;
    let payload = ErrorPayload::from_payload(&response.payload).unwrap();
    assert_eq!(payload.code, "AUTH_FAILED");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heartbeat_echo() {
    let (relay, _repo) = start_relay(|_| {}).await;

    let mut client = TestClient::connect(relay.control_addr).await;
    client.authenticate("T").await;

    let msg = ControlMessage::new(MessageType::Heartbeat, "hb-1", Default::default());
    client.send(msg).await;
    let reply = client.recv().await;
    assert_eq!(reply.msg_type, MessageType::Heartbeat);
    assert_eq!(reply.request_id, "hb-1");
    assert!(reply.payload.get("timestamp").and_then(|v| v.as_i64()).is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_endpoint() {
    let (relay, _repo) = start_relay(|_| {}).await;

    let response = http_get(relay.http_addr, "example.test", "/health").await;
    let text = String::from_utf8(response).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains(r#""status":"healthy""#));
    assert!(text.contains(r#""tunnels":0"#));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_subdomain_is_404() {
    let (relay, _repo) = start_relay(|_| {}).await;

    let response = http_get(relay.http_addr, "ghost.example.test", "/").await;
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 404"));

    // A host outside the server domain is a bad request.
    let response = http_get(relay.http_addr, "example.test", "/").await;
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_cleanup() {
    let (relay, repo) = start_relay(|_| {}).await;

    let mut client = TestClient::connect(relay.control_addr).await;
    client.authenticate("T").await;
    client.open_http_tunnel("one").await;
    let _s1 = client.attach_mux(hello_responder).await;
    client.open_http_tunnel("two").await;
    let _s2 = client.attach_mux(hello_responder).await;
    assert_eq!(relay.registry.count(), 2);

    // Drop the control connection without a goodbye.
    drop(client);

    let registry = relay.registry.clone();
    wait_for(|| registry.count() == 0, "cleanup after disconnect").await;

    assert!(repo.get_tunnel_by_subdomain("one").await.unwrap().is_none());
    assert!(repo.get_tunnel_by_subdomain("two").await.unwrap().is_none());
    assert!(repo.get_active_tunnels_by_client("client-1").await.unwrap().is_empty());

    let response = http_get(relay.http_addr, "one.example.test", "/").await;
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 404"));

    // The subdomains are free for the next client.
    let mut next = TestClient::connect(relay.control_addr).await;
    next.authenticate("T2").await;
    next.open_http_tunnel("one").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mux_establishment_deadline() {
    let (relay, repo) = start_relay(|config| {
        config.mux_accept_timeout = Duration::from_millis(400);
    })
    .await;

    let mut client = TestClient::connect(relay.control_addr).await;
    client.authenticate("T").await;
    let accepted = client.open_http_tunnel("late").await;

    // Never dial the mux listener; the relay must retire the tunnel.
    let registry = relay.registry.clone();
    wait_for(|| registry.count() == 0, "mux deadline teardown").await;
    assert!(repo.get_tunnel_by_subdomain("late").await.unwrap().is_none());

    // The subdomain is immediately reusable on the same connection.
    let _establish = client.recv().await; // pending new_connection from the first attempt
    let second = client.open_http_tunnel("late").await;
    assert_ne!(second.tunnel_id, accepted.tunnel_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_tunnel_round_trip() {
    let (relay, _repo) = start_relay(|config| {
        config.tcp_port_range = Some((38040, 38042));
    })
    .await;

    let mut client = TestClient::connect(relay.control_addr).await;
    client.authenticate("T").await;

    let response = client.request_tunnel("db", TunnelProtocol::Tcp).await;
    assert_eq!(response.msg_type, MessageType::TcpResponse);
    let accepted = TunnelAccepted::from_payload(&response.payload).unwrap();
    let public_port = accepted.public_port.expect("tcp tunnel gets a port");
    assert_eq!(public_port, 38040);

    let _session = client.attach_mux(echo_responder).await;

    let mut socket = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    socket.write_all(b"ping-1").await.unwrap();
    let mut buf = [0u8; 6];
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping-1");

    socket.write_all(b"ping-2").await.unwrap();
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping-2");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sse_streams_without_buffering() {
    let (relay, _repo) = start_relay(|_| {}).await;

    let mut client = TestClient::connect(relay.control_addr).await;
    client.authenticate("T").await;
    client.open_http_tunnel("events").await;
    let _session = client.attach_mux(sse_responder).await;

    let mut socket = TcpStream::connect(("127.0.0.1", relay.http_addr.port()))
        .await
        .unwrap();
    socket
        .write_all(b"GET /stream HTTP/1.1\r\nHost: events.example.test\r\n\r\n")
        .await
        .unwrap();

    let started = Instant::now();
    let mut received = Vec::new();
    let mut arrival = Vec::new();
    let mut buf = [0u8; 4096];
    while arrival.len() < 3 {
        let n = timeout(Duration::from_secs(3), socket.read(&mut buf))
            .await
            .expect("event within deadline")
            .unwrap();
        assert!(n > 0, "stream ended early");
        received.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&received);
        for i in arrival.len()..3 {
            if text.contains(&format!("event-{i}")) {
                arrival.push(started.elapsed());
            }
        }
    }

    // Events are produced at ~400/800/1200 ms. Per-chunk flushing means
    // each must arrive well before the next one is even generated; a fully
    // buffered copy would deliver all three together at the end.
    assert!(arrival[0] < Duration::from_millis(750), "first event late: {:?}", arrival[0]);
    assert!(arrival[1] < Duration::from_millis(1150), "second event late: {:?}", arrival[1]);
    assert!(
        arrival[2] >= arrival[0] + Duration::from_millis(500),
        "events were batched: {arrival:?}"
    );
}

/// Local service stand-in: a sizeable response with an exact length.
async fn large_body_responder(mut stream: MuxStream) {
    const BODY_LEN: usize = 2 * 1024 * 1024;
    let mut buf = vec![0u8; 4096];
    let _ = stream.read(&mut buf).await;

    let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {BODY_LEN}\r\n\r\n");
    stream.write_all(head.as_bytes()).await.unwrap();
    let mut body = vec![0u8; BODY_LEN];
    for (i, byte) in body.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    stream.write_all(&body).await.unwrap();
    let _ = stream.flush().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_large_body_preserved() {
    const BODY_LEN: usize = 2 * 1024 * 1024;
    let (relay, _repo) = start_relay(|_| {}).await;

    let mut client = TestClient::connect(relay.control_addr).await;
    client.authenticate("T").await;
    client.open_http_tunnel("bulk").await;
    let _session = client.attach_mux(large_body_responder).await;

    let response = http_get(relay.http_addr, "bulk.example.test", "/blob").await;
    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("complete head")
        + 4;
    let body = &response[header_end..];
    assert_eq!(body.len(), BODY_LEN);
    for (i, byte) in body.iter().enumerate().step_by(37 * 1024) {
        assert_eq!(*byte, (i % 251) as u8, "corrupt byte at offset {i}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_message_does_not_kill_session() {
    let (relay, _repo) = start_relay(|_| {}).await;

    let mut client = TestClient::connect(relay.control_addr).await;
    client.authenticate("T").await;

    client
        .ws
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();
    let response = client.recv().await;
    assert_eq!(response.msg_type, MessageType::Error);
    let payload = ErrorPayload::from_payload(&response.payload).unwrap();
    assert_eq!(payload.code, "INVALID_MESSAGE");

    // The session survives validation failures.
    client
        .send(ControlMessage::new(MessageType::Heartbeat, "hb-2", Default::default()))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply.msg_type, MessageType::Heartbeat);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_requests_share_one_tunnel() {
    let (relay, _repo) = start_relay(|_| {}).await;

    let mut client = TestClient::connect(relay.control_addr).await;
    client.authenticate("T").await;
    client.open_http_tunnel("busy").await;
    let _session = client.attach_mux(hello_responder).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let addr = relay.http_addr;
        handles.push(tokio::spawn(async move {
            http_get(addr, "busy.example.test", "/").await
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(&response, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
    }
}
