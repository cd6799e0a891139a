// End-to-end chat flow over a scripted transport, driven through the
// public API only: connect with an identity, auto-join, stream
// messages, send, leave, disconnect, reconnect.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use colloquy_client::config::ClientConfig;
use colloquy_client::session::ChatSession;
use colloquy_client::transport::{
    ChatConnection, ChatTransport, ConnectionSetup, InboundStream, StreamPayload,
};
use colloquy_common::protocol::message::MessageType;
use colloquy_common::protocol::routing::{decode_route, RouteMetadata};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

// ── Scripted transport ──────────────────────────────────────────────

#[derive(Default)]
struct ScriptedTransport {
    opens: AtomicUsize,
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    type Conn = ScriptedConnection;

    async fn open(&self, _endpoint: &Url, _setup: ConnectionSetup) -> Result<ScriptedConnection> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedConnection::default())
    }
}

#[derive(Default)]
struct ScriptedConnection {
    requests: Mutex<Vec<(String, Value)>>,
    reject_requests: AtomicBool,
    closed: AtomicBool,
    streams: Mutex<Vec<ScriptedStreamHandle>>,
}

#[derive(Clone)]
struct ScriptedStreamHandle {
    tx: mpsc::UnboundedSender<Result<StreamPayload>>,
    cancelled: Arc<AtomicBool>,
}

impl ScriptedConnection {
    fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }

    fn push_text(&self, raw: &str) {
        let streams = self.streams.lock().unwrap();
        let handle = streams.last().expect("no stream opened");
        handle.tx.send(Ok(StreamPayload::Text(raw.to_string()))).expect("stream closed");
    }

    fn stream_cancelled(&self) -> bool {
        self.streams.lock().unwrap().last().expect("no stream opened").cancelled.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatConnection for ScriptedConnection {
    async fn request_response(&self, route: RouteMetadata, payload: Value) -> Result<()> {
        let name = decode_route(route.as_bytes()).expect("valid route metadata").to_string();
        self.requests.lock().unwrap().push((name, payload));
        if self.reject_requests.load(Ordering::SeqCst) {
            return Err(anyhow!("request rejected by scripted server"));
        }
        Ok(())
    }

    fn fire_and_forget(&self, _route: RouteMetadata, _payload: Value) -> Result<()> {
        Ok(())
    }

    async fn request_stream(
        &self,
        route: RouteMetadata,
        _payload: Value,
    ) -> Result<Box<dyn InboundStream>> {
        decode_route(route.as_bytes()).expect("valid route metadata");
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.streams
            .lock()
            .unwrap()
            .push(ScriptedStreamHandle { tx, cancelled: Arc::clone(&cancelled) });
        Ok(Box::new(ScriptedStream { rx, cancelled }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct ScriptedStream {
    rx: mpsc::UnboundedReceiver<Result<StreamPayload>>,
    cancelled: Arc<AtomicBool>,
}

#[async_trait]
impl InboundStream for ScriptedStream {
    fn request(&mut self, _n: u32) {}

    async fn next(&mut self) -> Option<Result<StreamPayload>> {
        self.rx.recv().await
    }

    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.rx.close();
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn full_chat_flow_over_a_scripted_transport() {
    init_tracing();
    let transport = Arc::new(ScriptedTransport::default());
    let session = ChatSession::new(ClientConfig::default(), Arc::clone(&transport));

    // Connect as alice; the join handshake follows automatically.
    let conn = session.connect(Some("alice")).await.expect("connect");
    assert!(session.is_connected());
    settle().await;
    assert_eq!(conn.requests(), vec![(
        "chat.join".to_string(),
        json!({"username": "alice", "type": "JOIN"}),
    )]);

    // Subscribe and receive a broadcast from another participant.
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let subscription = session
        .subscribe(move |message| sink.lock().unwrap().push(message))
        .await
        .expect("subscribe");
    conn.push_text(
        r#"{"username":"bob","message":"hi alice","timestamp":"2024-01-01T00:00:00Z","type":"MESSAGE"}"#,
    );
    settle().await;
    {
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].username.as_deref(), Some("bob"));
        assert_eq!(received[0].message.as_deref(), Some("hi alice"));
        assert_eq!(received[0].kind, MessageType::Message);
    }

    // Send a line; delivery is acknowledged but nothing awaits it here.
    session.send("alice", "hey bob");
    settle().await;
    assert!(conn.requests().contains(&(
        "chat.send".to_string(),
        json!({"username": "alice", "message": "hey bob", "type": "MESSAGE"}),
    )));

    // Leave, then tear down.
    session.leave("alice").await;
    session.disconnect().await;
    settle().await;
    assert!(!session.is_connected());
    assert!(conn.is_closed());
    assert!(conn.stream_cancelled());
    drop(subscription);

    // A later reconnect starts clean: the join handshake runs again.
    let conn = session.connect(Some("alice")).await.expect("reconnect");
    settle().await;
    assert_eq!(transport.opens.load(Ordering::SeqCst), 2);
    assert_eq!(conn.requests(), vec![(
        "chat.join".to_string(),
        json!({"username": "alice", "type": "JOIN"}),
    )]);
}

#[tokio::test]
async fn teardown_proceeds_when_the_server_rejects_the_leave() {
    init_tracing();
    let transport = Arc::new(ScriptedTransport::default());
    let session = ChatSession::new(ClientConfig::default(), transport);

    let conn = session.connect(Some("alice")).await.expect("connect");
    settle().await;
    conn.reject_requests.store(true, Ordering::SeqCst);

    session.leave("alice").await;
    session.disconnect().await;

    assert!(!session.is_connected());
    assert!(conn.is_closed());
    let leaves: Vec<_> =
        conn.requests().into_iter().filter(|(route, _)| route == "chat.leave").collect();
    assert_eq!(leaves.len(), 1, "the leave must have been attempted");
}
