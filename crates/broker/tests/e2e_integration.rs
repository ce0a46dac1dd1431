//! End-to-end integration tests for PtyBroker.
//!
//! These tests run a real broker on an ephemeral port and drive it the way a
//! browser panel would:
//! - WebSocket create, input, output, resize and destroy
//! - Reattach after disconnect
//! - Session end notifications
//! - REST API and per-user caps

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use broker::config::Config;
use broker::{Broker, Clock, ManualClock, Role, StaticTokenProvider, SystemClock};
use futures_util::{SinkExt, StreamExt};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const ALICE: &str = "alice-token";
const BOB: &str = "bob-token";
const WAIT: Duration = Duration::from_secs(10);

struct TestBroker {
    broker: Arc<Broker>,
    addr: SocketAddr,
    server: JoinHandle<anyhow::Result<()>>,
    dir: TempDir,
}

impl TestBroker {
    async fn start() -> Self {
        Self::start_with(|_| {}, Arc::new(SystemClock)).await
    }

    async fn start_with(configure: impl FnOnce(&mut Config), clock: Arc<dyn Clock>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.session.shell = "/bin/sh".to_string();
        config.session.default_cwd = dir.path().to_path_buf();
        config.session.kill_grace_ms = 500;
        configure(&mut config);

        let identity = Arc::new(
            StaticTokenProvider::default()
                .with_token(ALICE, "alice", Role::Admin)
                .with_token(BOB, "bob", Role::User),
        );
        let broker = Arc::new(Broker::with_parts(config, clock, identity));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.serve(listener).await })
        };

        Self {
            broker,
            addr,
            server,
            dir,
        }
    }

    fn api(&self, path: &str) -> String {
        format!("http://{}/api/terminal-pty{}", self.addr, path)
    }

    async fn stop(self) {
        self.broker.shutdown();
        let _ = timeout(WAIT, self.server).await;
    }
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
    output: String,
}

impl Client {
    async fn connect(addr: SocketAddr, token: &str) -> Self {
        let url = format!("ws://{}/terminal?token={}", addr, token);
        let (ws, _) = connect_async(url).await.expect("WebSocket connect failed");
        Self {
            ws,
            next_id: 1,
            output: String::new(),
        }
    }

    async fn request(&mut self, payload: Value) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let envelope = json!({ "id": id, "payload": payload });
        self.ws
            .send(Message::Text(envelope.to_string()))
            .await
            .unwrap();
        id
    }

    async fn send_input(&mut self, data: &str) {
        self.ws
            .send(Message::Binary(data.as_bytes().to_vec()))
            .await
            .unwrap();
    }

    /// Reads frames until a control message matches, collecting output.
    async fn recv_message<F>(&mut self, mut matches: F) -> Value
    where
        F: FnMut(&Value) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .expect("timed out waiting for message")
                .expect("connection closed")
                .expect("WebSocket error");
            match frame {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if matches(&value) {
                        return value;
                    }
                }
                Message::Binary(data) => self.output.push_str(&String::from_utf8_lossy(&data)),
                _ => {}
            }
        }
    }

    async fn reply(&mut self, id: u64) -> Value {
        self.recv_message(|v| v["id"] == json!(id)).await
    }

    async fn event(&mut self, kind: &str) -> Value {
        self.recv_message(|v| v["payload"]["type"] == kind).await
    }

    async fn create(&mut self) -> Value {
        let id = self.request(json!({ "type": "create_session" })).await;
        let reply = self.reply(id).await;
        assert_eq!(reply["payload"]["type"], "session_created", "{}", reply);
        reply["payload"]["session"].clone()
    }

    async fn wait_for_output(&mut self, needle: &str) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !self.output.contains(needle) {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Ok(Some(Ok(Message::Binary(data)))) => {
                    self.output.push_str(&String::from_utf8_lossy(&data))
                }
                Ok(Some(Ok(_))) => {}
                _ => return false,
            }
        }
        true
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

fn session_id(session: &Value) -> String {
    session["session_id"].as_str().unwrap().to_string()
}

fn pid_exists(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

// =============================================================================
// Transport
// =============================================================================

#[tokio::test]
async fn test_upgrade_without_token_is_refused() {
    let broker = TestBroker::start().await;

    let url = format!("ws://{}/terminal", broker.addr);
    match connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401, got {:?}", other.map(|_| ())),
    }

    let url = format!("ws://{}/terminal?token=wrong", broker.addr);
    match connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401, got {:?}", other.map(|_| ())),
    }

    broker.stop().await;
}

#[tokio::test]
async fn test_ping_pong() {
    let broker = TestBroker::start().await;
    let mut client = Client::connect(broker.addr, ALICE).await;

    let id = client.request(json!({ "type": "ping" })).await;
    let reply = client.reply(id).await;
    assert_eq!(reply["payload"]["type"], "pong");

    client.close().await;
    broker.stop().await;
}

// =============================================================================
// Session lifecycle
// =============================================================================

#[tokio::test]
async fn test_create_input_output_destroy() {
    let broker = TestBroker::start().await;
    let mut client = Client::connect(broker.addr, ALICE).await;

    let session = client.create().await;
    let id = session_id(&session);
    let pid = session["pid"].as_u64().unwrap() as u32;
    assert_eq!(session["cols"], 80);
    assert_eq!(session["rows"], 24);
    assert!(pid_exists(pid));

    // The tty echoes the command line, so match the printed line only.
    client.send_input("printf 'h%s\\n' i\n").await;
    assert!(client.wait_for_output("hi\r\n").await, "output: {:?}", client.output);

    let req = client
        .request(json!({ "type": "destroy_session", "session_id": id }))
        .await;
    let reply = client.reply(req).await;
    assert_eq!(reply["payload"]["type"], "session_destroyed");
    assert_eq!(reply["payload"]["session_id"], id.as_str());

    assert!(broker.broker.registry().get("alice", &id).is_none());
    let mut gone = false;
    for _ in 0..50 {
        if !pid_exists(pid) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(gone, "process {} still exists", pid);

    let req = client
        .request(json!({ "type": "destroy_session", "session_id": id }))
        .await;
    let reply = client.reply(req).await;
    assert_eq!(reply["payload"]["type"], "error");
    assert_eq!(reply["payload"]["code"], "session_not_found");

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_create_makes_missing_cwd() {
    let broker = TestBroker::start().await;
    let mut client = Client::connect(broker.addr, ALICE).await;
    let cwd = broker.dir.path().join("projects").join("new");

    let req = client
        .request(json!({ "type": "create_session", "cwd": cwd.display().to_string() }))
        .await;
    let reply = client.reply(req).await;
    assert_eq!(reply["payload"]["type"], "session_created");
    assert!(cwd.is_dir());

    client.send_input("pwd\n").await;
    assert!(client.wait_for_output(&cwd.display().to_string()).await);

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_disconnect_and_reattach() {
    let broker = TestBroker::start().await;

    let mut first = Client::connect(broker.addr, ALICE).await;
    let session = first.create().await;
    let id = session_id(&session);
    first.send_input("echo before_disconnect_$((40+2))\n").await;
    assert!(first.wait_for_output("before_disconnect_42").await);
    first.close().await;

    // Give the server a moment to process the close.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let kept = broker.broker.registry().get("alice", &id).unwrap();
    assert!(kept.is_running());

    let mut second = Client::connect(broker.addr, ALICE).await;
    let req = second
        .request(json!({ "type": "attach_session", "session_id": id }))
        .await;
    let reply = second.reply(req).await;
    assert_eq!(reply["payload"]["type"], "session_attached");
    assert_eq!(reply["payload"]["session"]["session_id"], id.as_str());
    assert_eq!(reply["payload"]["session"]["pid"], session["pid"]);

    // Recent output is replayed on attach.
    assert!(second.wait_for_output("before_disconnect_42").await);

    second.send_input("echo after_$((20+1))\n").await;
    assert!(second.wait_for_output("after_21").await);

    second.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_attach_supersedes_previous_connection() {
    let broker = TestBroker::start().await;

    let mut first = Client::connect(broker.addr, ALICE).await;
    let id = session_id(&first.create().await);

    let mut second = Client::connect(broker.addr, ALICE).await;
    let req = second
        .request(json!({ "type": "attach_session", "session_id": id }))
        .await;
    second.reply(req).await;

    let notice = first.event("session_detached").await;
    assert_eq!(notice["payload"]["session_id"], id.as_str());
    assert_eq!(notice["payload"]["reason"], "superseded");

    first.close().await;
    second.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_resize() {
    let broker = TestBroker::start().await;
    let mut client = Client::connect(broker.addr, ALICE).await;
    let id = session_id(&client.create().await);

    client
        .request(json!({ "type": "terminal_resize", "cols": 100, "rows": 30 }))
        .await;
    client.send_input("stty size\n").await;
    assert!(client.wait_for_output("30 100").await, "output: {:?}", client.output);

    let session = broker.broker.registry().get("alice", &id).unwrap();
    assert_eq!(session.geometry(), (100, 30));

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_process_exit_sends_session_ended() {
    let broker = TestBroker::start().await;
    let mut client = Client::connect(broker.addr, ALICE).await;
    let id = session_id(&client.create().await);

    client.send_input("exit 3\n").await;
    let ended = client.event("session_ended").await;
    assert_eq!(ended["payload"]["session_id"], id.as_str());
    assert_eq!(ended["payload"]["exit_code"], 3);
    assert_eq!(ended["payload"]["reason"], "process_exited");

    let req = client.request(json!({ "type": "list_sessions" })).await;
    let list = client.reply(req).await;
    assert_eq!(list["payload"]["sessions"], json!([]));

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_destroy_notifies_bound_connection() {
    let broker = TestBroker::start().await;
    let mut owner = Client::connect(broker.addr, BOB).await;
    let id = session_id(&owner.create().await);

    let mut other = Client::connect(broker.addr, BOB).await;
    let req = other
        .request(json!({ "type": "destroy_session", "session_id": id }))
        .await;
    assert_eq!(other.reply(req).await["payload"]["type"], "session_destroyed");

    let ended = owner.event("session_ended").await;
    assert_eq!(ended["payload"]["reason"], "destroyed");

    owner.close().await;
    other.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_idle_session_is_reaped() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let broker = TestBroker::start_with(
        |config| {
            config.session.idle_timeout_secs = 60;
            config.session.reap_interval_secs = 1;
            config.session.output_counts_as_activity = false;
        },
        clock.clone(),
    )
    .await;

    let mut client = Client::connect(broker.addr, ALICE).await;
    let id = session_id(&client.create().await);

    clock.advance(Duration::from_secs(61));
    let ended = client.event("session_ended").await;
    assert_eq!(ended["payload"]["session_id"], id.as_str());
    assert_eq!(ended["payload"]["reason"], "idle_timeout");
    assert!(broker.broker.registry().get("alice", &id).is_none());

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_owner_isolation_over_websocket() {
    let broker = TestBroker::start().await;
    let mut alice = Client::connect(broker.addr, ALICE).await;
    let id = session_id(&alice.create().await);

    let mut bob = Client::connect(broker.addr, BOB).await;
    let req = bob
        .request(json!({ "type": "attach_session", "session_id": id }))
        .await;
    let reply = bob.reply(req).await;
    assert_eq!(reply["payload"]["code"], "session_not_found");

    let req = bob.request(json!({ "type": "list_sessions" })).await;
    assert_eq!(bob.reply(req).await["payload"]["sessions"], json!([]));

    alice.close().await;
    bob.close().await;
    broker.stop().await;
}

// =============================================================================
// REST API
// =============================================================================

#[tokio::test]
async fn test_rest_parallel_creates_respect_cap() {
    let broker = TestBroker::start().await;
    let http = reqwest::Client::new();

    let requests = (0..20).map(|_| {
        http.post(broker.api("/create"))
            .bearer_auth(BOB)
            .json(&json!({}))
            .send()
    });
    let responses = futures_util::future::join_all(requests).await;

    let mut created = 0;
    let mut limited = 0;
    for response in responses {
        match response.unwrap().status().as_u16() {
            200 => created += 1,
            429 => limited += 1,
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(created, 5);
    assert_eq!(limited, 15);

    let list: Value = http
        .get(broker.api("/sessions"))
        .bearer_auth(BOB)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["success"], true);
    assert_eq!(list["sessions"].as_array().unwrap().len(), 5);

    let cleared = http
        .delete(broker.api("/sessions"))
        .bearer_auth(BOB)
        .send()
        .await
        .unwrap();
    assert_eq!(cleared.status(), 200);
    assert_eq!(broker.broker.registry().count_for("bob"), 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_rest_resize_and_destroy() {
    let broker = TestBroker::start().await;
    let http = reqwest::Client::new();

    let created: Value = http
        .post(broker.api("/create"))
        .bearer_auth(ALICE)
        .json(&json!({ "cols": 120, "rows": 40 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = session_id(&created["session"]);
    assert_eq!(created["session"]["cols"], 120);

    let resized = http
        .post(broker.api("/resize"))
        .bearer_auth(ALICE)
        .json(&json!({ "session_id": id, "cols": 90, "rows": 20 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resized.status(), 200);

    let invalid = http
        .post(broker.api("/resize"))
        .bearer_auth(ALICE)
        .json(&json!({ "session_id": id, "cols": 0, "rows": 20 }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), 400);

    // Bob cannot touch Alice's session.
    let foreign = http
        .delete(broker.api(&format!("/session/{}", id)))
        .bearer_auth(BOB)
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status(), 404);

    let destroyed = http
        .delete(broker.api(&format!("/session/{}", id)))
        .bearer_auth(ALICE)
        .send()
        .await
        .unwrap();
    assert_eq!(destroyed.status(), 200);
    assert!(broker.broker.registry().get("alice", &id).is_none());

    broker.stop().await;
}

#[tokio::test]
async fn test_rest_stats_requires_admin() {
    let broker = TestBroker::start().await;
    let http = reqwest::Client::new();

    http.post(broker.api("/create"))
        .bearer_auth(BOB)
        .json(&json!({}))
        .send()
        .await
        .unwrap();

    let forbidden = http
        .get(broker.api("/stats"))
        .bearer_auth(BOB)
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), 403);

    let unauthorized = http.get(broker.api("/stats")).send().await.unwrap();
    assert_eq!(unauthorized.status(), 401);

    let stats: Value = http
        .get(broker.api("/stats"))
        .bearer_auth(ALICE)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["success"], true);
    assert_eq!(stats["stats"]["total_users"], 1);
    assert_eq!(stats["stats"]["total_sessions"], 1);
    assert_eq!(stats["stats"]["max_sessions_per_user"], 5);
    assert_eq!(stats["stats"]["user_stats"][0]["user_id"], "bob");

    broker.stop().await;
}

#[tokio::test]
async fn test_shutdown_destroys_all_sessions() {
    let broker = TestBroker::start().await;
    let mut client = Client::connect(broker.addr, ALICE).await;
    let pid = client.create().await["pid"].as_u64().unwrap() as u32;
    client.close().await;

    let registry = broker.broker.registry().clone();
    broker.stop().await;

    assert_eq!(registry.count(), 0);
    assert!(!pid_exists(pid));
}
