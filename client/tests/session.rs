//! End-to-end tests against an in-process fake broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use outpost::{Error, Protocol, SessionState, TunnelConfig, TunnelSessionManager, TunnelStatus};
use outpost_shared::protocol::ControlMessage;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

type Ws = WebSocketStream<TcpStream>;

/// One client connection as seen by the broker
struct BrokerConn {
    auth: Option<String>,
    path: String,
    ws: Ws,
}

async fn spawn_broker() -> (String, mpsc::UnboundedReceiver<BrokerConn>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen: Arc<Mutex<(Option<String>, String)>> = Arc::default();
            let record = seen.clone();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let auth = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                *record.lock().unwrap() = (auth, req.uri().path().to_string());
                Ok(resp)
            };
            if let Ok(ws) = accept_hdr_async(stream, callback).await {
                let (auth, path) = seen.lock().unwrap().clone();
                let _ = tx.send(BrokerConn { auth, path, ws });
            }
        }
    });

    (url, rx)
}

impl BrokerConn {
    /// Next control message from the client, or `None` once it closes.
    async fn next_message(&mut self) -> Option<ControlMessage> {
        loop {
            let frame = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for the client")?;
            match frame.ok()? {
                Message::Text(text) => return Some(ControlMessage::decode(&text).unwrap()),
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }

    async fn send_json(&mut self, value: serde_json::Value) {
        self.send_text(value.to_string()).await;
    }

    async fn send_text(&mut self, text: String) {
        self.ws.send(Message::Text(text)).await.unwrap();
    }

    async fn forward(&mut self, request_id: &str, data: &[u8]) {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        self.send_json(json!({
            "action": "forward_request",
            "request_id": request_id,
            "data": STANDARD.encode(data),
        }))
        .await;
    }

    /// Answer the create_tunnel handshake.
    async fn accept_tunnel(&mut self, id: &str, public_url: &str) -> ControlMessage {
        let create = self.next_message().await.expect("client closed before create_tunnel");
        self.send_json(json!({
            "status": "ok",
            "tunnel": { "id": id, "public_url": public_url },
        }))
        .await;
        create
    }

    /// Collect terminal outcomes until `count` distinct request ids finished.
    async fn outcomes(&mut self, count: usize) -> HashMap<String, Outcome> {
        let mut partial: HashMap<String, Vec<u8>> = HashMap::new();
        let mut done: HashMap<String, Outcome> = HashMap::new();

        while done.len() < count {
            let msg = self.next_message().await.expect("client closed mid-test");
            match msg {
                ControlMessage::ForwardResponse(resp) => {
                    assert!(!done.contains_key(&resp.request_id), "frame after terminal for {}", resp.request_id);
                    partial.entry(resp.request_id.clone()).or_default().extend_from_slice(&resp.data);
                    if resp.is_final {
                        let data = partial.remove(&resp.request_id).unwrap_or_default();
                        done.insert(resp.request_id, Outcome::Data(data));
                    }
                }
                ControlMessage::ErrorResponse(err) => {
                    assert!(!done.contains_key(&err.request_id), "second terminal for {}", err.request_id);
                    done.insert(err.request_id, Outcome::Error(err.error));
                }
                ControlMessage::Heartbeat(_) => {}
                other => panic!("unexpected message from client: {:?}", other),
            }
        }
        done
    }
}

#[derive(Debug, PartialEq)]
enum Outcome {
    Data(Vec<u8>),
    Error(String),
}

async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn config(url: &str, protocol: Protocol, port: u16) -> TunnelConfig {
    let mut config = TunnelConfig::new(url, "secret", "myapp");
    config.protocol = protocol;
    config.local_host = "127.0.0.1".to_string();
    config.local_port = port;
    config.connect_timeout = Duration::from_secs(2);
    config.retry_count = 0;
    config.idle_timeout = Duration::from_millis(300);
    config.shutdown_timeout = Duration::from_secs(2);
    config
}

/// Open a tunnel and leave `run` going in the background.
async fn start(
    config: TunnelConfig,
    conns: &mut mpsc::UnboundedReceiver<BrokerConn>,
) -> (
    BrokerConn,
    outpost::CloseHandle,
    tokio::task::JoinHandle<(TunnelSessionManager, outpost::Result<()>)>,
) {
    let mut manager = TunnelSessionManager::new(config).unwrap();
    let broker = async {
        let mut conn = conns.recv().await.unwrap();
        conn.accept_tunnel("t1", "tcp://myapp.example.com:9000").await;
        conn
    };
    let (opened, conn) = tokio::join!(manager.open(), broker);
    opened.unwrap();

    let close = manager.close_handle();
    let run = tokio::spawn(async move {
        let result = manager.run().await;
        (manager, result)
    });
    (conn, close, run)
}

#[tokio::test]
async fn test_echo_end_to_end() {
    let (url, mut conns) = spawn_broker().await;
    let port = echo_server().await;
    let mut manager = TunnelSessionManager::new(config(&url, Protocol::Tcp, port)).unwrap();

    let broker = async {
        let mut conn = conns.recv().await.unwrap();
        let create = conn.accept_tunnel("t1", "tcp://myapp.example.com:9000").await;
        (conn, create)
    };
    let (opened, (mut conn, create)) = tokio::join!(manager.open(), broker);

    assert_eq!(conn.auth.as_deref(), Some("Bearer secret"));
    assert_eq!(conn.path, "/tunnel");
    let ControlMessage::CreateTunnel(create) = create else {
        panic!("expected create_tunnel, got {:?}", create);
    };
    assert_eq!(create.subdomain, "myapp");
    assert_eq!(create.local_port, port);
    assert_eq!(create.protocol, Protocol::Tcp);

    let tunnel = opened.unwrap();
    assert_eq!(tunnel.id, "t1");
    assert_eq!(tunnel.public_url, "tcp://myapp.example.com:9000");
    assert_eq!(tunnel.status, TunnelStatus::Active);
    assert_eq!(manager.state(), SessionState::Active);

    let close = manager.close_handle();
    let run = tokio::spawn(async move {
        let result = manager.run().await;
        (manager, result)
    });

    conn.forward("r1", b"PING").await;
    let outcomes = conn.outcomes(1).await;
    assert_eq!(outcomes.get("r1"), Some(&Outcome::Data(b"PING".to_vec())));

    close.close();
    assert!(conn.next_message().await.is_none());
    let (mut manager, result) = run.await.unwrap();
    result.unwrap();
    assert_eq!(manager.state(), SessionState::Closed);

    let tunnel = manager.tunnel().unwrap();
    assert_eq!(tunnel.bytes_sent, 4);
    assert_eq!(tunnel.bytes_recv, 4);
    assert_eq!(tunnel.status, TunnelStatus::Closed);

    // Closing again is harmless
    manager.close().await.unwrap();
    manager.close().await.unwrap();
    assert_eq!(manager.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_bad_messages_do_not_stop_dispatch() {
    let (url, mut conns) = spawn_broker().await;
    let port = echo_server().await;
    let (mut conn, close, run) = start(config(&url, Protocol::Tcp, port), &mut conns).await;

    conn.send_text("definitely not json".to_string()).await;
    conn.send_json(json!({"action": "rotate_keys", "epoch": 3})).await;
    conn.send_json(json!({"action": "forward_request"})).await;
    conn.send_json(json!({"action": "forward_request", "request_id": "bad", "data": "%%%"})).await;
    conn.send_json(json!({"action": "heartbeat", "tunnel_id": "t1"})).await;
    conn.forward("r2", b"still alive").await;

    let outcomes = conn.outcomes(1).await;
    assert_eq!(outcomes.get("r2"), Some(&Outcome::Data(b"still alive".to_vec())));
    assert!(!run.is_finished());

    close.close();
    let (manager, result) = run.await.unwrap();
    result.unwrap();
    assert_eq!(manager.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_dial_failure_reports_error_and_keeps_channel() {
    let (url, mut conns) = spawn_broker().await;
    let port = closed_port().await;
    let (mut conn, close, run) = start(config(&url, Protocol::Http, port), &mut conns).await;

    conn.forward("r1", b"GET / HTTP/1.1\r\n\r\n").await;
    let outcomes = conn.outcomes(1).await;
    assert!(matches!(outcomes.get("r1"), Some(Outcome::Error(_))));

    // The channel is still usable for the next request
    conn.forward("r2", b"GET / HTTP/1.1\r\n\r\n").await;
    let outcomes = conn.outcomes(1).await;
    assert!(matches!(outcomes.get("r2"), Some(Outcome::Error(_))));
    assert!(!run.is_finished());

    close.close();
    let (_, result) = run.await.unwrap();
    result.unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_do_not_cross() {
    let (url, mut conns) = spawn_broker().await;
    let port = echo_server().await;
    let (mut conn, close, run) = start(config(&url, Protocol::Tcp, port), &mut conns).await;

    let requests: Vec<(String, Vec<u8>)> = (0..8)
        .map(|i| (format!("req-{}", i), format!("payload number {}", i).repeat(i + 1).into_bytes()))
        .collect();
    for (id, data) in &requests {
        conn.forward(id, data).await;
    }

    let outcomes = conn.outcomes(requests.len()).await;
    assert_eq!(outcomes.len(), requests.len());
    for (id, data) in &requests {
        assert_eq!(outcomes.get(id), Some(&Outcome::Data(data.clone())), "{}", id);
    }

    close.close();
    let (manager, result) = run.await.unwrap();
    result.unwrap();
    let expected: u64 = requests.iter().map(|(_, d)| d.len() as u64).sum();
    let tunnel = manager.tunnel().unwrap();
    assert_eq!(tunnel.bytes_sent, expected);
    assert_eq!(tunnel.bytes_recv, expected);
}

#[tokio::test]
async fn test_broker_tunnel_closed() {
    let (url, mut conns) = spawn_broker().await;
    let port = echo_server().await;
    let (mut conn, _close, run) = start(config(&url, Protocol::Tcp, port), &mut conns).await;

    conn.send_json(json!({"action": "tunnel_closed", "reason": "maintenance"})).await;
    assert!(conn.next_message().await.is_none());

    let (manager, result) = run.await.unwrap();
    result.unwrap();
    assert_eq!(manager.state(), SessionState::Closed);
    assert_eq!(manager.tunnel().unwrap().status, TunnelStatus::Closed);
}

#[tokio::test]
async fn test_connection_loss_fails_session() {
    let (url, mut conns) = spawn_broker().await;
    let port = echo_server().await;
    let (conn, _close, run) = start(config(&url, Protocol::Tcp, port), &mut conns).await;

    drop(conn);

    let (manager, result) = timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed(_))), "{:?}", result);
    assert_eq!(manager.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_create_tunnel_refused() {
    let (url, mut conns) = spawn_broker().await;
    let mut manager = TunnelSessionManager::new(config(&url, Protocol::Http, 3000)).unwrap();

    let broker = async {
        let mut conn = conns.recv().await.unwrap();
        conn.next_message().await.unwrap();
        conn.send_json(json!({"status": "error", "message": "subdomain taken"})).await;
        conn
    };
    let (opened, _conn) = tokio::join!(manager.open(), broker);

    let err = opened.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{:?}", err);
    assert!(err.to_string().contains("subdomain taken"));
    assert_eq!(manager.state(), SessionState::Failed);
    assert!(manager.tunnel().is_none());
}

#[tokio::test]
async fn test_close_drains_in_flight_relays() {
    let (url, mut conns) = spawn_broker().await;

    // Answers half a second after the request arrives
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = socket.write_all(&buf[..n]).await;
            });
        }
    });

    let (mut conn, close, run) = start(config(&url, Protocol::Tcp, port), &mut conns).await;
    conn.forward("slow", b"later").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    close.close();

    let outcomes = conn.outcomes(1).await;
    assert_eq!(outcomes.get("slow"), Some(&Outcome::Data(b"later".to_vec())));

    let (manager, result) = run.await.unwrap();
    result.unwrap();
    assert_eq!(manager.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_shutdown_timeout_bounds_closing() {
    let (url, mut conns) = spawn_broker().await;

    // Accepts and never answers or closes
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (held_tx, mut held_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let _ = held_tx.send(socket);
        }
    });

    let mut config = config(&url, Protocol::Http, port);
    config.idle_timeout = Duration::from_secs(60);
    config.shutdown_timeout = Duration::from_millis(200);
    let (mut conn, close, run) = start(config, &mut conns).await;

    conn.forward("stuck", b"GET / HTTP/1.1\r\n\r\n").await;
    let mut held = held_rx.recv().await.unwrap();
    close.close();

    let (manager, result) = timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    result.unwrap();
    assert_eq!(manager.state(), SessionState::Closed);

    // The aborted relay released its local connection
    let mut buf = Vec::new();
    let read = timeout(Duration::from_secs(2), held.read_to_end(&mut buf)).await.unwrap();
    assert!(read.is_ok());
}
