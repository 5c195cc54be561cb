//! End-to-end tests for the streaming chat protocol, run with a real
//! WebSocket client against a server on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use pharmaai_backend::auth::SignedTokenVerifier;
use pharmaai_backend::config::Settings;
use pharmaai_backend::errors::ChatError;
use pharmaai_backend::llm::{ChatMessage, LlmClient};
use pharmaai_backend::registry::spawn_maintenance;
use pharmaai_backend::retrieval::{DocumentIndex, ScoredDocument};
use pharmaai_backend::server::router::router;
use pharmaai_backend::state::AppState;

const SECRET: &str = "ws-test-secret";
const TIMEOUT: Duration = Duration::from_secs(5);
const FRAGMENTS: [&str; 3] = ["Paracetamol ", "reduces ", "fever."];

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Streams the canned answer in three fragments with small gaps.
struct StreamingLlm;

#[async_trait]
impl LlmClient for StreamingLlm {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, ChatError> {
        Ok(FRAGMENTS.concat())
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String, ChatError>>, ChatError> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for fragment in FRAGMENTS {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if tx.send(Ok(fragment.to_string())).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ChatError> {
        Err(ChatError::Generation("no embedder in this test".to_string()))
    }
}

/// Refuses to stream, as when the model server is down.
struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, ChatError> {
        Err(ChatError::Generation("model server unavailable".to_string()))
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String, ChatError>>, ChatError> {
        Err(ChatError::Generation("model server unavailable".to_string()))
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ChatError> {
        Err(ChatError::Generation("model server unavailable".to_string()))
    }
}

struct StubIndex;

#[async_trait]
impl DocumentIndex for StubIndex {
    async fn search(&self, query: &str, _k: usize) -> Result<Vec<ScoredDocument>, ChatError> {
        if query.to_lowercase().contains("paracetamol") {
            Ok(vec![ScoredDocument {
                content: "Paracetamol 500mg, fever reducer".to_string(),
                metadata: json!({"name": "Paracetamol 500mg", "price": 32000}),
                score: 0.2,
            }])
        } else {
            Ok(vec![])
        }
    }
}

struct TestServer {
    ws_base: String,
    state: Arc<AppState>,
    _dir: TempDir,
}

async fn boot_server_with(llm: Arc<dyn LlmClient>, configure: fn(&mut Settings)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.auth.secret_key = SECRET.to_string();
    settings.database.chat_path = dir.path().join("chat.db");
    settings.database.index_path = dir.path().join("index.db");
    configure(&mut settings);

    let state = AppState::with_services(
        settings,
        llm,
        Arc::new(StubIndex),
        Arc::new(SignedTokenVerifier::new(SECRET)),
    )
    .await
    .unwrap();

    let app = router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        ws_base: format!("ws://{addr}/ws"),
        state,
        _dir: dir,
    }
}

async fn boot_server() -> TestServer {
    boot_server_with(Arc::new(StreamingLlm), |_| {}).await
}

async fn connect(server: &TestServer, user_id: i64) -> WsStream {
    let token = SignedTokenVerifier::new(SECRET).sign(user_id);
    let (ws, _) = connect_async(format!("{}?token={token}", server.ws_base))
        .await
        .unwrap();
    ws
}

async fn send_chat(ws: &mut WsStream, message: &str, session_id: Option<&str>) {
    let frame = json!({"message": message, "session_id": session_id});
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

/// Read the next text message as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Try to read a JSON message within `dur`. Returns None on timeout.
async fn try_read_json(ws: &mut WsStream, dur: Duration) -> Option<Value> {
    match timeout(dur, async {
        loop {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                return serde_json::from_str::<Value>(&text).ok();
            }
        }
    })
    .await
    {
        Ok(val) => val,
        Err(_) => None,
    }
}

/// Collect one exchange's events, ending at `end`, `error` or `rate_limit`.
async fn collect_exchange(ws: &mut WsStream) -> Vec<Value> {
    let mut events = Vec::new();
    loop {
        let event = read_json(ws).await;
        let last = matches!(
            event["type"].as_str().unwrap_or_default(),
            "end" | "error" | "rate_limit"
        );
        events.push(event);
        if last {
            return events;
        }
    }
}

/// Wait for the next close frame, skipping anything still queued before it.
async fn read_close(ws: &mut WsStream) -> (CloseCode, String) {
    let deadline = timeout(TIMEOUT, async {
        while let Some(msg) = ws.next().await {
            if let Ok(Message::Close(Some(frame))) = msg {
                return (frame.code, frame.reason.to_string());
            }
        }
        panic!("connection ended without a close frame");
    });
    deadline.await.expect("no close frame within deadline")
}

/// The registry registers a connection just after the upgrade completes,
/// so tests poll instead of racing it.
async fn wait_for_connections(server: &TestServer, user_id: i64, expected: usize) {
    for _ in 0..100 {
        if server.state.registry.user_connections(user_id) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("user {user_id} never reached {expected} live connections");
}

#[tokio::test]
async fn bad_tokens_close_with_policy_violation() {
    let server = boot_server().await;

    let (mut ws, _) = connect_async(format!("{}?token=forged", server.ws_base))
        .await
        .unwrap();
    let (code, reason) = read_close(&mut ws).await;
    assert_eq!(code, CloseCode::Policy);
    assert_eq!(reason, "authentication failed");

    // Missing token entirely gets the same treatment.
    let (mut ws, _) = connect_async(server.ws_base.clone()).await.unwrap();
    let (code, _) = read_close(&mut ws).await;
    assert_eq!(code, CloseCode::Policy);
}

#[tokio::test]
async fn connection_cap_rejects_the_excess_connection() {
    let server = boot_server_with(Arc::new(StreamingLlm), |settings| {
        settings.websocket.max_connections_per_user = 1;
    })
    .await;

    let _held = connect(&server, 1).await;
    wait_for_connections(&server, 1, 1).await;

    let mut rejected = connect(&server, 1).await;
    let (code, reason) = read_close(&mut rejected).await;
    assert_eq!(code, CloseCode::Policy);
    assert_eq!(reason, "connection limit reached");

    // The cap is per user, so another account still gets in.
    let _other = connect(&server, 2).await;
    wait_for_connections(&server, 2, 1).await;
    assert_eq!(server.state.registry.user_connections(1), 1);
}

#[tokio::test]
async fn streamed_exchange_emits_the_full_sequence() {
    let server = boot_server().await;
    let mut ws = connect(&server, 1).await;

    send_chat(&mut ws, "Usual dose of paracetamol?", None).await;
    let events = collect_exchange(&mut ws).await;

    assert_eq!(events[0]["type"], "status");
    assert_eq!(events[0]["status"], "Initializing chat session...");
    assert_eq!(events[1]["status"], "Loading conversation history...");
    assert_eq!(events[2]["status"], "Searching for relevant information...");
    assert_eq!(events[3]["status"], "Generating answer...");

    assert_eq!(events[4]["type"], "start");
    assert!(events[4]["session_id"].is_string());

    let chunks: String = events[5..events.len() - 1]
        .iter()
        .map(|event| {
            assert_eq!(event["type"], "chunk");
            event["content"].as_str().unwrap()
        })
        .collect();
    assert_eq!(chunks, FRAGMENTS.concat());

    let end = events.last().unwrap();
    assert_eq!(end["type"], "end");
    assert_eq!(end["sources"][0]["name"], "Paracetamol 500mg");
    assert!(end["created_at"].is_string());
}

#[tokio::test]
async fn follow_up_messages_stay_in_the_session() {
    let server = boot_server().await;
    let mut ws = connect(&server, 1).await;

    send_chat(&mut ws, "Tell me about paracetamol", None).await;
    let events = collect_exchange(&mut ws).await;
    let sid = events[4]["session_id"].as_str().unwrap().to_string();

    send_chat(&mut ws, "And for children?", Some(&sid)).await;
    let events = collect_exchange(&mut ws).await;
    assert_eq!(events[4]["session_id"], sid);

    // Both exchanges are on disk under the one session.
    let messages = server.state.store.messages_page(&sid, 0, 50).await.unwrap();
    assert_eq!(messages.len(), 4);
}

#[tokio::test]
async fn protocol_errors_leave_the_connection_usable() {
    let server = boot_server().await;
    let mut ws = connect(&server, 1).await;

    ws.send(Message::text("not json".to_string())).await.unwrap();
    let event = read_json(&mut ws).await;
    assert_eq!(event["type"], "error");
    assert_eq!(event["error"], "ValidationError");
    assert_eq!(event["detail"], "malformed frame");

    send_chat(&mut ws, "   ", None).await;
    let event = read_json(&mut ws).await;
    assert_eq!(event["error"], "ValidationError");
    assert_eq!(event["detail"], "message must not be empty");

    send_chat(&mut ws, "id of an unknown session", Some("no-such-session")).await;
    let events = collect_exchange(&mut ws).await;
    let last = events.last().unwrap();
    assert_eq!(last["error"], "NotFound");
    assert_eq!(last["detail"], "Session not found");

    // After all of that, a real exchange still works.
    send_chat(&mut ws, "Usual dose of paracetamol?", None).await;
    let events = collect_exchange(&mut ws).await;
    assert_eq!(events.last().unwrap()["type"], "end");
}

#[tokio::test]
async fn messages_over_the_burst_get_rate_limited() {
    let server = boot_server_with(Arc::new(StreamingLlm), |settings| {
        settings.rate_limit.messages_per_minute = 30;
        settings.rate_limit.burst_size = 1;
    })
    .await;
    let mut ws = connect(&server, 1).await;

    send_chat(&mut ws, "Usual dose of paracetamol?", None).await;
    let events = collect_exchange(&mut ws).await;
    assert_eq!(events.last().unwrap()["type"], "end");

    send_chat(&mut ws, "One more straight away", None).await;
    let events = collect_exchange(&mut ws).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "rate_limit");
    assert!(events[0]["retry_after"].as_f64().unwrap() > 0.0);
    assert!(events[0]["detail"]
        .as_str()
        .unwrap()
        .starts_with("Rate limit exceeded"));
}

#[tokio::test]
async fn pong_frames_are_consumed_silently() {
    let server = boot_server().await;
    let mut ws = connect(&server, 1).await;

    ws.send(Message::text(r#"{"type": "pong"}"#.to_string()))
        .await
        .unwrap();
    assert!(try_read_json(&mut ws, Duration::from_millis(300)).await.is_none());

    send_chat(&mut ws, "Usual dose of paracetamol?", None).await;
    let events = collect_exchange(&mut ws).await;
    assert_eq!(events.last().unwrap()["type"], "end");
}

#[tokio::test]
async fn generation_failures_are_reported_in_band() {
    let server = boot_server_with(Arc::new(FailingLlm), |_| {}).await;
    let mut ws = connect(&server, 1).await;

    send_chat(&mut ws, "Usual dose of paracetamol?", None).await;
    let events = collect_exchange(&mut ws).await;

    // Narration and start still happen; the failure follows in-band.
    assert_eq!(events[4]["type"], "start");
    let last = events.last().unwrap();
    assert_eq!(last["type"], "error");
    assert_eq!(last["error"], "GenerationError");

    // Nothing was persisted for the failed exchange.
    let sessions = server.state.store.list_sessions(1).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].message_count, 0);

    // The connection survives and can try again.
    send_chat(&mut ws, "Second try", None).await;
    let events = collect_exchange(&mut ws).await;
    assert_eq!(events.last().unwrap()["error"], "GenerationError");
}

#[tokio::test]
async fn idle_connections_get_pinged_then_closed() {
    let server = boot_server().await;
    let _maintenance = spawn_maintenance(
        server.state.registry.clone(),
        Duration::from_millis(100),
        Duration::from_millis(300),
    );

    let mut ws = connect(&server, 1).await;

    let (pings, code, reason) = timeout(Duration::from_secs(3), async {
        let mut pings = 0;
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let event: Value = serde_json::from_str(&text).unwrap();
                    if event["type"] == "ping" {
                        pings += 1;
                    }
                }
                Some(Ok(Message::Close(Some(frame)))) => {
                    return (pings, frame.code, frame.reason.to_string());
                }
                Some(Ok(_)) => {}
                other => panic!("connection ended without a close frame: {other:?}"),
            }
        }
    })
    .await
    .expect("idle close not received");

    assert!(pings >= 1, "expected at least one heartbeat ping");
    assert_eq!(code, CloseCode::Normal);
    assert_eq!(reason, "idle timeout");
    assert_eq!(server.state.registry.total_connections(), 0);
}
