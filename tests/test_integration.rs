//! Integration tests: a real gateway on an ephemeral port, driven over
//! HTTP with JSON-RPC calls and parsed SSE streams.

use anyhow::Result;
use async_trait::async_trait;
use clawrepl::agent::{
    AgentDriver, AgentEvent, AgentHandle, EchoAgent, ToolInvocation, TurnContext,
};
use clawrepl::config::Config;
use clawrepl::confirm::{ConfirmationRequest, ToolAccess, options_for};
use clawrepl::gateway::{AppState, build_router};
use clawrepl::session::Transcript;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const TOKEN: &str = "test-token";

// ── Server harness ───────────────────────────────────────────────

struct TestServer {
    base_url: String,
    state: AppState,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(mut config: Config) -> Self {
        config.gateway.require_token = true;
        config.gateway.tokens = vec![TOKEN.into()];

        let state = AppState::new(&config, Arc::new(EchoAgent::new()));
        let app = build_router(state.clone(), &config.gateway);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            client: reqwest::Client::new(),
        }
    }

    async fn start_default() -> Self {
        Self::start(Config::default()).await
    }

    fn add_agent(&self, agent_id: &str, driver: Arc<dyn AgentDriver>) {
        self.state
            .registry
            .insert(Arc::new(AgentHandle {
                id: agent_id.to_string(),
                driver,
                transcript: Transcript::new(),
            }))
            .unwrap();
    }

    async fn rpc(&self, path: &str, method: &str, params: Value) -> Value {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(TOKEN)
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "rpc transport failure");
        response.json().await.unwrap()
    }

    /// Fire an RPC in the background (for calls that block on a turn).
    fn rpc_in_background(
        &self,
        path: &str,
        method: &str,
        params: Value,
    ) -> tokio::task::JoinHandle<Value> {
        let client = self.client.clone();
        let url = format!("{}{path}", self.base_url);
        let method = method.to_string();
        tokio::spawn(async move {
            client
                .post(url)
                .bearer_auth(TOKEN)
                .json(&json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params}))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap()
        })
    }

    async fn subscribe(&self, agent_id: &str) -> SseClient {
        self.subscribe_with_cursor(agent_id, None).await
    }

    async fn subscribe_with_cursor(&self, agent_id: &str, last_event_id: Option<&str>) -> SseClient {
        let mut request = self
            .client
            .get(format!("{}/agent/{agent_id}/events", self.base_url))
            .bearer_auth(TOKEN);
        if let Some(cursor) = last_event_id {
            request = request.header("Last-Event-ID", cursor);
        }
        let response = request.send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(
            response
                .headers()
                .get("content-type")
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
        SseClient::new(response)
    }
}

// ── SSE client ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct SseFrame {
    id: Option<u64>,
    event: String,
    data: Value,
}

struct SseClient {
    stream: std::pin::Pin<
        Box<dyn futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>,
    >,
    buffer: String,
}

impl SseClient {
    fn new(response: reqwest::Response) -> Self {
        Self {
            stream: Box::pin(response.bytes_stream()),
            buffer: String::new(),
        }
    }

    /// Next complete frame, waiting up to `timeout`.
    async fn next_frame(&mut self, timeout: Duration) -> Option<SseFrame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.pop_buffered() {
                return Some(frame);
            }
            let chunk = tokio::time::timeout_at(deadline, self.stream.next())
                .await
                .ok()??
                .ok()?;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    /// Read frames until one matches `event`, failing on timeout.
    async fn next_event(&mut self, event: &str) -> SseFrame {
        for _ in 0..200 {
            let frame = self
                .next_frame(Duration::from_secs(5))
                .await
                .unwrap_or_else(|| panic!("stream ended waiting for {event}"));
            if frame.event == event {
                return frame;
            }
        }
        panic!("{event} not observed within 200 frames");
    }

    fn pop_buffered(&mut self) -> Option<SseFrame> {
        let end = self.buffer.find("\n\n")?;
        let raw: String = self.buffer.drain(..end + 2).collect();

        let mut id = None;
        let mut event = String::new();
        let mut data = Value::Null;
        for line in raw.lines() {
            if let Some(value) = line.strip_prefix("id: ") {
                id = value.trim().parse().ok();
            } else if let Some(value) = line.strip_prefix("event: ") {
                event = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("data: ") {
                data = serde_json::from_str(value).unwrap_or(Value::Null);
            }
        }
        Some(SseFrame { id, event, data })
    }
}

// ── Test drivers ─────────────────────────────────────────────────

/// Emits one chunk then stalls until cancelled.
struct StallDriver;

#[async_trait]
impl AgentDriver for StallDriver {
    async fn start_turn(
        &self,
        ctx: TurnContext,
        _content: &str,
    ) -> Result<mpsc::Receiver<AgentEvent>> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let _ = tx
                .send(AgentEvent::ContentDelta {
                    text: "working…".into(),
                })
                .await;
            ctx.cancel.cancelled().await;
        });
        Ok(rx)
    }
}

/// Pauses mid-turn on a shell-exec confirmation.
struct ShellApprovalDriver;

#[async_trait]
impl AgentDriver for ShellApprovalDriver {
    async fn start_turn(
        &self,
        ctx: TurnContext,
        _content: &str,
    ) -> Result<mpsc::Receiver<AgentEvent>> {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let tool = ToolInvocation {
                name: "shell".into(),
                id: "t1".into(),
                params: json!({"command": "rm -r build"}),
            };
            let _ = tx
                .send(AgentEvent::BatchStarted {
                    tools: vec![tool.clone()],
                })
                .await;
            let _ = tx
                .send(AgentEvent::ToolStarted {
                    tool_id: tool.id.clone(),
                })
                .await;

            let decision = ctx
                .confirmations
                .request(ConfirmationRequest {
                    agent_id: ctx.agent_id.clone(),
                    request_id: ctx.request_id.clone(),
                    tool_name: tool.name,
                    options: options_for(ToolAccess::ShellExec),
                    cwd: None,
                    timeout: Duration::from_secs(10),
                })
                .await;

            let allowed = decision.allows();
            let _ = tx
                .send(AgentEvent::ToolCompleted {
                    tool_id: tool.id,
                    success: allowed,
                    error: None,
                    output: allowed.then(|| "removed".to_string()),
                })
                .await;
            let _ = tx.send(AgentEvent::BatchCompleted).await;
            let _ = tx
                .send(AgentEvent::ContentDelta {
                    text: if allowed { "cleaned up" } else { "left as-is" }.to_string(),
                })
                .await;
        });
        Ok(rx)
    }
}

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn two_observers_see_one_turn_identically() {
    let server = TestServer::start_default().await;
    server.rpc("/", "create_agent", json!({"agent_id": "alpha"})).await;

    let mut observer_b = server.subscribe("alpha").await;
    let mut observer_c = server.subscribe("alpha").await;

    let response = server
        .rpc(
            "/agent/alpha",
            "send",
            json!({"content": "hi", "request_id": "r1"}),
        )
        .await;
    assert_eq!(response["result"]["request_id"], "r1");
    assert_eq!(response["result"]["content"], "You said: hi");

    let mut frames_b = Vec::new();
    loop {
        let frame = observer_b.next_frame(Duration::from_secs(5)).await.unwrap();
        let done = frame.event == "turn_completed";
        frames_b.push(frame);
        if done {
            break;
        }
    }
    let mut frames_c = Vec::new();
    for _ in 0..frames_b.len() {
        frames_c.push(observer_c.next_frame(Duration::from_secs(5)).await.unwrap());
    }

    // Identical streams: same events, same seqs, same payloads.
    assert_eq!(frames_b, frames_c);
    assert_eq!(frames_b.first().unwrap().event, "turn_started");
    assert!(frames_b.iter().all(|f| f.data["request_id"] == "r1"));
    assert!(frames_b.iter().any(|f| f.event == "content_chunk"));

    let completed = frames_b.last().unwrap();
    assert_eq!(completed.data["content"], "You said: hi");
    assert_eq!(completed.data["halted"], false);

    // ids strictly increase and match the payload seq.
    let ids: Vec<u64> = frames_b.iter().map(|f| f.id.unwrap()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    for frame in &frames_b {
        assert_eq!(frame.id.unwrap(), frame.data["seq"].as_u64().unwrap());
    }
}

#[tokio::test]
async fn cancelling_a_queued_turn_never_shows_turn_started() {
    let server = TestServer::start_default().await;
    server.add_agent("alpha", Arc::new(StallDriver));

    let mut observer = server.subscribe("alpha").await;

    // r1 occupies the agent.
    let r1 = server.rpc_in_background(
        "/agent/alpha",
        "send",
        json!({"content": "first", "request_id": "r1"}),
    );
    observer.next_event("turn_started").await;

    // r2 queues behind it, then gets cancelled while waiting.
    let r2 = server.rpc_in_background(
        "/agent/alpha",
        "send",
        json!({"content": "second", "request_id": "r2"}),
    );
    // Let r2 reach the queue before cancelling it.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cancel_r2 = server
        .rpc("/agent/alpha", "cancel", json!({"request_id": "r2"}))
        .await;
    assert_eq!(cancel_r2["result"]["cancelled"], true);

    let r2_response = r2.await.unwrap();
    assert_eq!(r2_response["error"]["code"], -32000);

    // Unblock and finish r1.
    let cancel_r1 = server
        .rpc("/agent/alpha", "cancel", json!({"request_id": "r1"}))
        .await;
    assert_eq!(cancel_r1["result"]["cancelled"], true);
    r1.await.unwrap();

    // On the wire, r2 produced exactly one frame: turn_cancelled.
    let mut r2_frames = Vec::new();
    loop {
        let frame = observer.next_frame(Duration::from_secs(5)).await.unwrap();
        let r1_done = frame.event == "turn_cancelled" && frame.data["request_id"] == "r1";
        if frame.data["request_id"] == "r2" {
            r2_frames.push(frame);
        } else if r1_done {
            break;
        }
    }
    assert_eq!(r2_frames.len(), 1);
    assert_eq!(r2_frames[0].event, "turn_cancelled");
}

#[tokio::test]
async fn reconnect_with_last_event_id_replays_the_gap() {
    let server = TestServer::start_default().await;
    server.rpc("/", "create_agent", json!({"agent_id": "alpha"})).await;

    // First session: watch one turn, remember the cursor, disconnect.
    let last_seen = {
        let mut session = server.subscribe("alpha").await;
        server
            .rpc(
                "/agent/alpha",
                "send",
                json!({"content": "one", "request_id": "r1"}),
            )
            .await;
        session.next_event("turn_completed").await.id.unwrap()
    };

    // A turn happens while detached.
    server
        .rpc(
            "/agent/alpha",
            "send",
            json!({"content": "two", "request_id": "r2"}),
        )
        .await;

    // Reconnect with the cursor: the whole r2 turn replays in order.
    let mut session = server
        .subscribe_with_cursor("alpha", Some(&last_seen.to_string()))
        .await;

    let mut replayed = Vec::new();
    loop {
        let frame = session.next_frame(Duration::from_secs(5)).await.unwrap();
        let done = frame.event == "turn_completed";
        replayed.push(frame);
        if done {
            break;
        }
    }

    assert!(replayed.iter().all(|f| f.data["request_id"] == "r2"));
    assert_eq!(replayed.first().unwrap().event, "turn_started");
    let ids: Vec<u64> = replayed.iter().map(|f| f.id.unwrap()).collect();
    assert_eq!(ids.first(), Some(&(last_seen + 1)));
    assert!(ids.windows(2).all(|w| w[0] + 1 == w[1]));
}

#[tokio::test]
async fn garbage_last_event_id_means_no_replay() {
    let server = TestServer::start_default().await;
    server.rpc("/", "create_agent", json!({"agent_id": "alpha"})).await;
    server
        .rpc(
            "/agent/alpha",
            "send",
            json!({"content": "one", "request_id": "r1"}),
        )
        .await;

    let mut session = server.subscribe_with_cursor("alpha", Some("not-a-seq")).await;

    // Nothing replays; the next frame is live (a fresh turn), not history.
    let live = server.rpc_in_background(
        "/agent/alpha",
        "send",
        json!({"content": "two", "request_id": "r2"}),
    );
    let frame = session.next_event("turn_started").await;
    assert_eq!(frame.data["request_id"], "r2");
    live.await.unwrap();
}

#[tokio::test]
async fn foreign_terminal_confirms_a_paused_tool() {
    let server = TestServer::start_default().await;
    server.add_agent("alpha", Arc::new(ShellApprovalDriver));

    let mut initiator_view = server.subscribe("alpha").await;
    let mut foreign_view = server.subscribe("alpha").await;

    let send = server.rpc_in_background(
        "/agent/alpha",
        "send",
        json!({"content": "clean the build dir", "request_id": "r1"}),
    );

    // The non-initiating terminal answers the confirmation.
    let requested = foreign_view.next_event("confirmation_requested").await;
    let confirm_id = requested.data["confirm_id"].as_str().unwrap().to_string();
    assert_eq!(requested.data["tool"], "shell");
    assert_eq!(requested.data["options"], json!(["allow_once", "deny"]));

    let confirm = server
        .rpc(
            "/agent/alpha",
            "confirm",
            json!({"confirm_id": confirm_id, "decision": "allow_once"}),
        )
        .await;
    assert_eq!(confirm["result"]["accepted"], true);

    // Second submission loses the race.
    let confirm_again = server
        .rpc(
            "/agent/alpha",
            "confirm",
            json!({"confirm_id": confirm_id, "decision": "deny"}),
        )
        .await;
    assert_eq!(confirm_again["result"]["accepted"], false);

    // Everyone sees the resolution; the turn runs to completion.
    for view in [&mut initiator_view, &mut foreign_view] {
        let resolved = view.next_event("confirmation_resolved").await;
        assert_eq!(resolved.data["confirm_id"], confirm_id.as_str());
        assert_eq!(resolved.data["decision"], "allow_once");
        assert!(resolved.data["resolved_at"].is_string());

        let completed = view.next_event("turn_completed").await;
        assert_eq!(completed.data["content"], "cleaned up");
    }

    let response = send.await.unwrap();
    assert_eq!(response["result"]["content"], "cleaned up");
}

#[tokio::test]
async fn idle_stream_receives_heartbeats() {
    let mut config = Config::default();
    config.sync.heartbeat_interval_secs = 1;
    let server = TestServer::start(config).await;
    server.rpc("/", "create_agent", json!({"agent_id": "alpha"})).await;

    let mut session = server.subscribe("alpha").await;

    for _ in 0..2 {
        let frame = session.next_frame(Duration::from_secs(5)).await.unwrap();
        assert_eq!(frame.event, "ping");
        assert_eq!(frame.id, None);
        assert_eq!(frame.data["agent_id"], "alpha");
    }
}

#[tokio::test]
async fn auth_is_enforced_on_rpc_and_stream() {
    let server = TestServer::start_default().await;

    // RPC without a token.
    let response = server
        .client
        .post(format!("{}/", server.base_url))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "list_agents"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // RPC with a wrong token.
    let response = server
        .client
        .post(format!("{}/agent/alpha", server.base_url))
        .bearer_auth("wrong")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "send", "params": {"content": "x"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Stream without a token.
    let response = server
        .client
        .get(format!("{}/agent/alpha/events", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Health stays public.
    let response = server
        .client
        .get(format!("{}/health", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn invalid_agent_ids_are_rejected_on_the_stream() {
    let server = TestServer::start_default().await;
    let response = server
        .client
        .get(format!("{}/agent/..%2Fescape/events", server.base_url))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn rpc_error_surface_matches_the_contract() {
    let server = TestServer::start_default().await;
    server.rpc("/", "create_agent", json!({"agent_id": "alpha"})).await;

    // Unknown method.
    let response = server.rpc("/", "load_session", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);

    // Out-of-range pagination.
    let response = server
        .rpc(
            "/agent/alpha",
            "get_messages",
            json!({"offset": 0, "limit": 0}),
        )
        .await;
    assert_eq!(response["error"]["code"], -32602);

    // Cancel of an unknown request is a structured non-error.
    let response = server
        .rpc("/agent/alpha", "cancel", json!({"request_id": "ghost"}))
        .await;
    assert_eq!(response["result"]["cancelled"], false);
    assert_eq!(response["result"]["reason"], "not_found");

    // get_messages echoes pagination and totals.
    server
        .rpc(
            "/agent/alpha",
            "send",
            json!({"content": "hello", "request_id": "r1"}),
        )
        .await;
    let response = server
        .rpc(
            "/agent/alpha",
            "get_messages",
            json!({"offset": 0, "limit": 10}),
        )
        .await;
    assert_eq!(response["result"]["agent_id"], "alpha");
    assert_eq!(response["result"]["total"], 2);
    assert_eq!(response["result"]["messages"][0]["role"], "user");
    assert_eq!(response["result"]["messages"][0]["content"], "hello");
}

#[tokio::test]
async fn closing_a_stream_does_not_cancel_the_turn() {
    let server = TestServer::start_default().await;
    server.rpc("/", "create_agent", json!({"agent_id": "alpha"})).await;

    // A watcher connects and immediately goes away.
    let session = server.subscribe("alpha").await;
    drop(session);

    // The turn still runs to completion for the RPC caller and later
    // observers.
    let response = server
        .rpc(
            "/agent/alpha",
            "send",
            json!({"content": "still here", "request_id": "r1"}),
        )
        .await;
    assert_eq!(response["result"]["content"], "You said: still here");

    let mut late = server.subscribe_with_cursor("alpha", Some("0")).await;
    let completed = late.next_event("turn_completed").await;
    assert_eq!(completed.data["request_id"], "r1");
}
