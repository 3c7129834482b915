//! Turn coordinator — one writer per agent, with a terminal event on every
//! exit path.
//!
//! A `send` request acquires the agent's turn lock, publishes
//! `turn_started`, drains the driver's event channel into wire events, and
//! always finishes a started turn with exactly one `turn_completed` or
//! `turn_cancelled`. Cancellation is cooperative: a request that is
//! cancelled while still queued behind another turn never publishes
//! `turn_started` at all.

use crate::agent::{AgentDriver, AgentEvent, ToolInvocation, TurnContext};
use crate::confirm::ConfirmationBroker;
use crate::events::{EventHub, EventKind, ToolSpec};
use crate::util::{collapse_whitespace, random_hex};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bytes of entropy in a generated request ID (hex-doubled on the wire).
const REQUEST_ID_BYTES: usize = 16;

/// Result of a completed turn, echoed to the RPC caller.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub request_id: String,
    pub content: String,
    pub halted: bool,
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("turn cancelled")]
    Cancelled { request_id: String },
    #[error("agent driver failed: {message}")]
    Driver {
        request_id: String,
        message: String,
    },
}

impl TurnError {
    pub fn request_id(&self) -> &str {
        match self {
            TurnError::Cancelled { request_id } | TurnError::Driver { request_id, .. } => {
                request_id
            }
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub cancelled: bool,
    pub request_id: String,
}

#[derive(Default)]
struct AgentTurnState {
    /// Single-writer lock per agent.
    lock: tokio::sync::Mutex<()>,
    /// Cancellation signals for queued and running requests.
    inflight: Mutex<HashMap<String, CancellationToken>>,
}

/// Serializes turns per agent and translates driver events to wire events.
pub struct TurnCoordinator {
    hub: Arc<EventHub>,
    confirmations: Arc<ConfirmationBroker>,
    agents: Mutex<HashMap<String, Arc<AgentTurnState>>>,
}

impl TurnCoordinator {
    pub fn new(hub: Arc<EventHub>, confirmations: Arc<ConfirmationBroker>) -> Self {
        Self {
            hub,
            confirmations,
            agents: Mutex::new(HashMap::new()),
        }
    }

    fn state_for(&self, agent_id: &str) -> Arc<AgentTurnState> {
        let mut agents = self.agents.lock();
        Arc::clone(agents.entry(agent_id.to_string()).or_default())
    }

    /// Drop per-agent turn state (after `destroy_agent`). In-flight tokens
    /// are cancelled so a queued turn unblocks promptly.
    pub fn remove_agent(&self, agent_id: &str) {
        let state = self.agents.lock().remove(agent_id);
        if let Some(state) = state {
            for token in state.inflight.lock().values() {
                token.cancel();
            }
        }
    }

    /// Run one turn to its terminal event.
    ///
    /// Registers the cancellation signal before queuing on the turn lock so
    /// a `cancel` that races the queue wait still lands; then, in order:
    /// cancelled-while-queued check, `turn_started`, the driver's event
    /// stream, and the terminal event.
    pub async fn run_turn(
        &self,
        driver: &Arc<dyn AgentDriver>,
        agent_id: &str,
        content: &str,
        request_id: Option<String>,
    ) -> Result<TurnOutcome, TurnError> {
        let request_id = request_id.unwrap_or_else(|| random_hex(REQUEST_ID_BYTES));
        let state = self.state_for(agent_id);
        let token = CancellationToken::new();

        state
            .inflight
            .lock()
            .insert(request_id.clone(), token.clone());

        let result = self
            .run_registered(&state, driver, agent_id, content, &request_id, &token)
            .await;

        state.inflight.lock().remove(&request_id);
        result
    }

    async fn run_registered(
        &self,
        state: &AgentTurnState,
        driver: &Arc<dyn AgentDriver>,
        agent_id: &str,
        content: &str,
        request_id: &str,
        token: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        // Cancelled before we even queued: terminal event only, no
        // turn_started.
        if token.is_cancelled() {
            return Err(self.cancelled(agent_id, request_id));
        }

        let _guard = tokio::select! {
            guard = state.lock.lock() => guard,
            () = token.cancelled() => {
                debug!(agent_id, request_id, "turn cancelled while queued");
                return Err(self.cancelled(agent_id, request_id));
            }
        };

        // The signal may have landed between winning the lock and here.
        if token.is_cancelled() {
            return Err(self.cancelled(agent_id, request_id));
        }

        self.hub
            .publish(agent_id, Some(request_id), EventKind::TurnStarted);

        let ctx = TurnContext {
            agent_id: agent_id.to_string(),
            request_id: request_id.to_string(),
            cancel: token.clone(),
            confirmations: Arc::clone(&self.confirmations),
        };

        let mut rx = match driver.start_turn(ctx, content).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(agent_id, request_id, error = %e, "driver refused turn");
                self.hub
                    .publish(agent_id, Some(request_id), EventKind::TurnCancelled);
                return Err(TurnError::Driver {
                    request_id: request_id.to_string(),
                    message: e.to_string(),
                });
            }
        };

        match self.drain(agent_id, request_id, token, &mut rx).await {
            Ok((content, halted)) => {
                self.hub.publish(
                    agent_id,
                    Some(request_id),
                    EventKind::TurnCompleted {
                        content: content.clone(),
                        halted,
                    },
                );
                Ok(TurnOutcome {
                    request_id: request_id.to_string(),
                    content,
                    halted,
                })
            }
            Err(err) => {
                // Terminal guarantee: cancellation and driver failure both
                // end the request with turn_cancelled.
                self.hub
                    .publish(agent_id, Some(request_id), EventKind::TurnCancelled);
                Err(err)
            }
        }
    }

    /// Pump the driver channel, publishing the wire image of each event and
    /// accumulating content for the RPC response.
    async fn drain(
        &self,
        agent_id: &str,
        request_id: &str,
        token: &CancellationToken,
        rx: &mut mpsc::Receiver<AgentEvent>,
    ) -> Result<(String, bool), TurnError> {
        let mut accumulated = String::new();
        let mut halted = false;

        loop {
            let event = tokio::select! {
                () = token.cancelled() => {
                    debug!(agent_id, request_id, "turn cancelled mid-stream");
                    return Err(TurnError::Cancelled {
                        request_id: request_id.to_string(),
                    });
                }
                event = rx.recv() => event,
            };

            let Some(event) = event else {
                return Ok((accumulated, halted));
            };

            match event {
                AgentEvent::Halted => halted = true,
                AgentEvent::Failed { error } => {
                    warn!(agent_id, request_id, error = %error, "driver failed mid-turn");
                    return Err(TurnError::Driver {
                        request_id: request_id.to_string(),
                        message: error,
                    });
                }
                other => {
                    if let AgentEvent::ContentDelta { text } = &other {
                        accumulated.push_str(text);
                    }
                    let kind = wire_kind(other);
                    self.hub.publish(agent_id, Some(request_id), kind);
                }
            }
        }
    }

    fn cancelled(&self, agent_id: &str, request_id: &str) -> TurnError {
        self.hub
            .publish(agent_id, Some(request_id), EventKind::TurnCancelled);
        TurnError::Cancelled {
            request_id: request_id.to_string(),
        }
    }

    /// Flag an in-flight request for cancellation.
    ///
    /// A request that already reached its terminal event is gone from the
    /// in-flight map, so this reports `cancelled: false` — an expected
    /// race, not an error.
    pub fn cancel(&self, agent_id: &str, request_id: &str) -> CancelOutcome {
        let state = {
            let agents = self.agents.lock();
            agents.get(agent_id).cloned()
        };

        let cancelled = state.is_some_and(|state| {
            let inflight = state.inflight.lock();
            match inflight.get(request_id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            }
        });

        CancelOutcome {
            cancelled,
            request_id: request_id.to_string(),
        }
    }

    /// Number of requests currently registered for an agent (queued or
    /// running).
    pub fn inflight_count(&self, agent_id: &str) -> usize {
        let agents = self.agents.lock();
        agents
            .get(agent_id)
            .map_or(0, |state| state.inflight.lock().len())
    }
}

/// Map a driver event to its wire image. Total over the variants that reach
/// it; `Halted` and `Failed` are consumed by the coordinator first.
fn wire_kind(event: AgentEvent) -> EventKind {
    match event {
        AgentEvent::ContentDelta { text } => EventKind::ContentChunk { text },
        AgentEvent::ThinkingStarted => EventKind::ThinkingStarted,
        AgentEvent::ThinkingEnded { duration } => EventKind::ThinkingEnded {
            duration_ms: duration.as_millis() as u64,
        },
        AgentEvent::ToolDetected { name, tool_id } => EventKind::ToolDetected { name, tool_id },
        AgentEvent::BatchStarted { tools } => EventKind::BatchStarted {
            tools: tools.into_iter().map(tool_spec).collect(),
        },
        AgentEvent::ToolStarted { tool_id } => EventKind::ToolStarted { tool_id },
        AgentEvent::ToolCompleted {
            tool_id,
            success,
            error,
            output,
        } => EventKind::ToolCompleted {
            tool_id,
            success,
            error,
            output,
        },
        AgentEvent::BatchHalted => EventKind::BatchHalted,
        AgentEvent::BatchCompleted => EventKind::BatchCompleted,
        AgentEvent::Halted | AgentEvent::Failed { .. } => {
            unreachable!("consumed by the coordinator before mapping")
        }
    }
}

fn tool_spec(tool: ToolInvocation) -> ToolSpec {
    let rendered = match &tool.params {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    ToolSpec {
        name: tool.name,
        id: tool.id,
        params: collapse_whitespace(&rendered),
    }
}
