//! Agent abstraction — the boundary between the sync core and whatever
//! actually produces a turn (LLM loop, scripted driver, echo stub).
//!
//! A driver runs each turn as its own producer task and hands back the
//! receiving end of a bounded channel. The coordinator drains that channel,
//! maps each [`AgentEvent`] to its wire image, and publishes it. Drivers
//! that execute tools get a [`TurnContext`] so they can pause on the
//! confirmation broker and observe cooperative cancellation.

use crate::confirm::ConfirmationBroker;
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod registry;

pub use registry::{AgentHandle, AgentRegistry};

/// Queue length between a turn's producer task and the coordinator.
const TURN_CHANNEL_CAPACITY: usize = 64;

static AGENT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap());

/// Validate the agent-ID grammar: leading alphanumeric, then up to 127 of
/// `[A-Za-z0-9._-]`. Rejects empties and anything that could walk a path.
pub fn is_valid_agent_id(id: &str) -> bool {
    AGENT_ID_RE.is_match(id) && id != "." && id != ".." && !id.contains("..")
}

// ── Internal turn events ─────────────────────────────────────────

/// A tool invocation as parsed from the model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub id: String,
    pub params: serde_json::Value,
}

/// Events a driver produces while running one turn.
///
/// This set is closed; the coordinator maps every variant to a wire event
/// (there are no silently dropped variants). `Halted` flags the
/// tool-iteration ceiling and `Failed` carries a driver error — both are
/// consumed by the coordinator rather than forwarded verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    ContentDelta { text: String },
    ThinkingStarted,
    ThinkingEnded { duration: Duration },
    ToolDetected { name: String, tool_id: String },
    BatchStarted { tools: Vec<ToolInvocation> },
    ToolStarted { tool_id: String },
    ToolCompleted {
        tool_id: String,
        success: bool,
        error: Option<String>,
        output: Option<String>,
    },
    BatchHalted,
    BatchCompleted,
    /// The driver hit its tool-iteration ceiling; the turn still completes.
    Halted,
    /// The driver failed irrecoverably; the coordinator cancels the turn
    /// and surfaces the error to the RPC caller.
    Failed { error: String },
}

/// Everything a driver may need while producing one turn.
#[derive(Clone)]
pub struct TurnContext {
    pub agent_id: String,
    pub request_id: String,
    /// Cooperative cancellation; producers should stop emitting shortly
    /// after this fires.
    pub cancel: CancellationToken,
    /// Cross-terminal approval broker for tool calls that need a human.
    pub confirmations: Arc<ConfirmationBroker>,
}

/// Produces the event stream for one turn of one agent.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Start a turn. The returned receiver yields events until the turn is
    /// done; closing it (dropping all senders) signals exhaustion.
    async fn start_turn(
        &self,
        ctx: TurnContext,
        content: &str,
    ) -> Result<mpsc::Receiver<AgentEvent>>;
}

// ── Echo driver ──────────────────────────────────────────────────

/// Provider-free driver that thinks briefly and echoes the prompt in
/// chunks. Lets the server run end-to-end without any model configured.
pub struct EchoAgent {
    chunk_size: usize,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self { chunk_size: 24 }
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for EchoAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentDriver for EchoAgent {
    async fn start_turn(
        &self,
        ctx: TurnContext,
        content: &str,
    ) -> Result<mpsc::Receiver<AgentEvent>> {
        let (tx, rx) = mpsc::channel(TURN_CHANNEL_CAPACITY);
        let reply = format!("You said: {content}");
        let chunk_size = self.chunk_size;

        tokio::spawn(async move {
            let started = Instant::now();
            if tx.send(AgentEvent::ThinkingStarted).await.is_err() {
                return;
            }
            let _ = tx
                .send(AgentEvent::ThinkingEnded {
                    duration: started.elapsed(),
                })
                .await;

            let chars: Vec<char> = reply.chars().collect();
            for chunk in chars.chunks(chunk_size) {
                if ctx.cancel.is_cancelled() {
                    return;
                }
                let text: String = chunk.iter().collect();
                if tx.send(AgentEvent::ContentDelta { text }).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
