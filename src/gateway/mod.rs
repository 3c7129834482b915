//! Axum-based HTTP gateway: JSON-RPC over POST plus the SSE stream.
//!
//! Two route groups with different resource rules:
//! - RPC routes (`POST /`, `POST /agent/{id}`) sit behind a body limit, a
//!   request timeout, and a shared concurrency cap.
//! - The stream route (`GET /agent/{id}/events`) is registered outside
//!   those layers. Streams are long-lived by design; if they counted
//!   against the RPC cap, a handful of idle terminals would starve the
//!   server.
//!
//! The gateway is loopback-only: non-local binds are refused at startup.

use crate::agent::{AgentDriver, AgentRegistry, is_valid_agent_id};
use crate::config::{Config, GatewayConfig};
use crate::confirm::ConfirmationBroker;
use crate::events::{Decision, EventHub};
use crate::security::TokenGuard;
use crate::session::Role;
use crate::turns::{TurnCoordinator, TurnError};
use crate::util::truncate_with_ellipsis;
use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

pub mod rpc;
pub mod sse;

/// Maximum RPC request body size (1 MB).
pub const MAX_BODY_SIZE: usize = 1_048_576;

/// How often the idle watchdog re-checks activity.
const WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// Last-RPC-activity stamp; attached streams keep it fresh via the
/// watchdog.
pub struct ActivityTracker {
    last: Mutex<Instant>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<EventHub>,
    pub registry: Arc<AgentRegistry>,
    pub turns: Arc<TurnCoordinator>,
    pub confirmations: Arc<ConfirmationBroker>,
    pub auth: Arc<TokenGuard>,
    pub activity: Arc<ActivityTracker>,
    pub shutdown: CancellationToken,
    pub heartbeat: Duration,
}

impl AppState {
    /// Wire the full sync core from config, with `driver` backing every
    /// created agent.
    pub fn new(config: &Config, driver: Arc<dyn AgentDriver>) -> Self {
        let hub = Arc::new(EventHub::new(config.sync.hub_config()));
        let confirmations = Arc::new(ConfirmationBroker::new(Arc::clone(&hub)));
        let turns = Arc::new(TurnCoordinator::new(
            Arc::clone(&hub),
            Arc::clone(&confirmations),
        ));
        let registry = Arc::new(AgentRegistry::new(driver));
        let auth = Arc::new(TokenGuard::new(
            config.gateway.require_token,
            &config.gateway.tokens,
        ));

        Self {
            hub,
            registry,
            turns,
            confirmations,
            auth,
            activity: Arc::new(ActivityTracker::new()),
            shutdown: CancellationToken::new(),
            heartbeat: Duration::from_secs(config.sync.heartbeat_interval_secs.max(1)),
        }
    }
}

/// Extract the bearer token from an Authorization header ("" when absent).
pub(crate) fn bearer_token(headers: &HeaderMap) -> &str {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .unwrap_or("")
}

/// Build the router: limited RPC routes plus the exempt stream route.
pub fn build_router(state: AppState, gateway: &GatewayConfig) -> Router {
    let rpc_routes = Router::new()
        .route("/", post(handle_root_rpc))
        .route("/agent/{agent_id}", post(handle_agent_rpc))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(gateway.request_timeout_secs.max(1)),
        ))
        .layer(GlobalConcurrencyLimitLayer::new(
            gateway.max_concurrent_rpc.max(1),
        ));

    Router::new()
        .route("/health", get(handle_health))
        .route("/agent/{agent_id}/events", get(sse::handle_events))
        .merge(rpc_routes)
        .with_state(state)
}

/// Run the gateway until shutdown (signal, `shutdown_server`, or idle
/// timeout).
pub async fn run_gateway(config: &Config, driver: Arc<dyn AgentDriver>) -> Result<()> {
    let host = config.gateway.host.as_str();
    if !is_loopback_host(host) {
        anyhow::bail!(
            "refusing to bind to {host} — this gateway is loopback-only; use 127.0.0.1"
        );
    }

    let state = AppState::new(config, driver);
    let app = build_router(state.clone(), &config.gateway);

    let addr: SocketAddr = format!("{host}:{}", config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual = listener.local_addr()?;

    println!("🖥  clawrepl gateway listening on http://{actual}");
    println!("  POST /                      — server RPC (create_agent, list_agents, …)");
    println!("  POST /agent/{{id}}            — agent RPC (send, cancel, confirm, get_messages)");
    println!("  GET  /agent/{{id}}/events     — live event stream (SSE)");
    println!("  GET  /health                — health check");
    if let Some(token) = state.auth.ephemeral_token() {
        println!();
        println!("  🔐 No token configured — this session accepts:");
        println!("     Authorization: Bearer {token}");
    } else if state.auth.requires_token() {
        println!("  🔒 Auth: bearer token required");
    } else {
        println!("  ⚠️  Auth: DISABLED (all requests accepted)");
    }
    println!("  Press Ctrl+C to stop.\n");

    if config.gateway.idle_shutdown_secs > 0 {
        tokio::spawn(idle_watchdog(
            state.clone(),
            Duration::from_secs(config.gateway.idle_shutdown_secs),
        ));
    }

    let shutdown = state.shutdown.clone();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "127.0.0.1" | "localhost" | "::1" | "[::1]")
}

/// Whether the server has been idle past `timeout`. Attached streams count
/// as activity, so the deadline keeps sliding while anyone is watching.
pub fn idle_exceeded(state: &AppState, timeout: Duration) -> bool {
    if state.hub.total_subscribers() > 0 {
        state.activity.touch();
        return false;
    }
    state.activity.idle_for() >= timeout
}

async fn idle_watchdog(state: AppState, timeout: Duration) {
    loop {
        tokio::time::sleep(WATCHDOG_TICK.min(timeout)).await;
        if state.shutdown.is_cancelled() {
            return;
        }
        if idle_exceeded(&state, timeout) {
            info!(
                idle_secs = timeout.as_secs(),
                "no activity and no attached streams — shutting down"
            );
            state.shutdown.cancel();
            return;
        }
    }
}

// ═════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ═════════════════════════════════════════════════════════════════

/// GET /health — always public (no secrets leaked).
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "agents": state.registry.len(),
        "subscribers": state.hub.total_subscribers(),
    }))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": "Unauthorized — provide Authorization: Bearer <token>"
        })),
    )
        .into_response()
}

/// Parse the envelope, rejecting malformed JSON and unsupported versions.
fn parse_envelope(body: &[u8]) -> Result<rpc::RpcRequest, Value> {
    let request: rpc::RpcRequest = serde_json::from_slice(body)
        .map_err(|e| rpc::err(None, rpc::PARSE_ERROR, format!("parse error: {e}")))?;
    if !request.is_supported_version() {
        return Err(rpc::err(
            request.id,
            rpc::INVALID_REQUEST,
            "jsonrpc must be \"2.0\"",
        ));
    }
    Ok(request)
}

/// POST / — server-level RPC.
async fn handle_root_rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.auth.is_authorized(bearer_token(&headers)) {
        return unauthorized();
    }
    state.activity.touch();

    let request = match parse_envelope(&body) {
        Ok(request) => request,
        Err(response) => return Json(response).into_response(),
    };
    let id = request.id.clone();

    let response = match request.method.as_str() {
        "create_agent" => {
            let params = if request.params.is_null() {
                rpc::CreateAgentParams::default()
            } else {
                match rpc::parse_params(request.params) {
                    Ok(params) => params,
                    Err(msg) => return Json(rpc::err(id, rpc::INVALID_PARAMS, msg)).into_response(),
                }
            };
            match state.registry.create(params.agent_id) {
                Ok(handle) => rpc::ok(id, json!({ "agent_id": handle.id })),
                Err(e) => rpc::err(id, rpc::INVALID_PARAMS, e.to_string()),
            }
        }
        "destroy_agent" => match rpc::parse_params::<rpc::DestroyAgentParams>(request.params) {
            Ok(params) => {
                let destroyed = state.registry.remove(&params.agent_id);
                if destroyed {
                    state.turns.remove_agent(&params.agent_id);
                }
                rpc::ok(id, json!({ "destroyed": destroyed }))
            }
            Err(msg) => rpc::err(id, rpc::INVALID_PARAMS, msg),
        },
        "list_agents" => rpc::ok(id, json!({ "agents": state.registry.list() })),
        "shutdown_server" => {
            info!("shutdown requested over RPC");
            state.shutdown.cancel();
            rpc::ok(id, json!({ "shutting_down": true }))
        }
        other => rpc::err(
            id,
            rpc::METHOD_NOT_FOUND,
            format!("unknown method: {other}"),
        ),
    };

    Json(response).into_response()
}

/// POST /agent/{agent_id} — agent-scoped RPC.
async fn handle_agent_rpc(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.auth.is_authorized(bearer_token(&headers)) {
        return unauthorized();
    }
    state.activity.touch();

    if !is_valid_agent_id(&agent_id) {
        return Json(rpc::err(None, rpc::INVALID_PARAMS, "invalid agent id")).into_response();
    }

    let request = match parse_envelope(&body) {
        Ok(request) => request,
        Err(response) => return Json(response).into_response(),
    };
    let id = request.id.clone();

    let response = match request.method.as_str() {
        "send" => match rpc::parse_params::<rpc::SendParams>(request.params) {
            Ok(params) => handle_send(&state, &agent_id, params, id).await,
            Err(msg) => rpc::err(id, rpc::INVALID_PARAMS, msg),
        },
        "cancel" => match rpc::parse_params::<rpc::CancelParams>(request.params) {
            Ok(params) => {
                let outcome = state.turns.cancel(&agent_id, &params.request_id);
                if outcome.cancelled {
                    rpc::ok(
                        id,
                        json!({ "cancelled": true, "request_id": outcome.request_id }),
                    )
                } else {
                    rpc::ok(
                        id,
                        json!({
                            "cancelled": false,
                            "request_id": outcome.request_id,
                            "reason": "not_found",
                        }),
                    )
                }
            }
            Err(msg) => rpc::err(id, rpc::INVALID_PARAMS, msg),
        },
        "confirm" => match rpc::parse_params::<rpc::ConfirmParams>(request.params) {
            Ok(params) => match Decision::parse_submitted(&params.decision) {
                Some(decision) => {
                    let accepted = state.confirmations.submit(&params.confirm_id, decision);
                    rpc::ok(id, json!({ "accepted": accepted }))
                }
                None => rpc::err(
                    id,
                    rpc::INVALID_PARAMS,
                    format!("unknown decision: {}", params.decision),
                ),
            },
            Err(msg) => rpc::err(id, rpc::INVALID_PARAMS, msg),
        },
        "get_messages" => match rpc::parse_params::<rpc::GetMessagesParams>(request.params) {
            Ok(params) => match params.validate() {
                Ok((offset, limit)) => match state.registry.get(&agent_id) {
                    Some(handle) => {
                        let page = handle.transcript.page(offset, limit);
                        rpc::ok(
                            id,
                            json!({
                                "agent_id": agent_id,
                                "total": page.total,
                                "offset": offset,
                                "limit": limit,
                                "messages": page.messages,
                            }),
                        )
                    }
                    None => rpc::err(id, rpc::INVALID_PARAMS, "unknown agent"),
                },
                Err(msg) => rpc::err(id, rpc::INVALID_PARAMS, msg),
            },
            Err(msg) => rpc::err(id, rpc::INVALID_PARAMS, msg),
        },
        other => rpc::err(
            id,
            rpc::METHOD_NOT_FOUND,
            format!("unknown method: {other}"),
        ),
    };

    Json(response).into_response()
}

async fn handle_send(
    state: &AppState,
    agent_id: &str,
    params: rpc::SendParams,
    id: Option<Value>,
) -> Value {
    let Some(handle) = state.registry.get(agent_id) else {
        return rpc::err(id, rpc::INVALID_PARAMS, "unknown agent");
    };

    info!(
        agent_id,
        content = %truncate_with_ellipsis(&params.content, 60),
        "turn requested"
    );

    handle.transcript.append(Role::User, params.content.clone());

    match state
        .turns
        .run_turn(&handle.driver, agent_id, &params.content, params.request_id)
        .await
    {
        Ok(outcome) => {
            handle
                .transcript
                .append(Role::Assistant, outcome.content.clone());
            rpc::ok(
                id,
                json!({
                    "content": outcome.content,
                    "request_id": outcome.request_id,
                }),
            )
        }
        Err(TurnError::Cancelled { request_id }) => rpc::err(
            id,
            rpc::TURN_CANCELLED,
            format!("turn {request_id} cancelled"),
        ),
        Err(TurnError::Driver {
            request_id,
            message,
        }) => {
            warn!(agent_id, request_id = %request_id, error = %message, "turn failed");
            rpc::err(id, rpc::INTERNAL_ERROR, message)
        }
    }
}
