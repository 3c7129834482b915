//! Wire event model — the closed set of events that cross the REPL boundary.
//!
//! Every terminal attached to an agent observes the same stream of these
//! events, whether it initiated the current turn or not. Events are
//! immutable once published: the hub stamps `agent_id` and `seq` when it
//! constructs the published value, so there is no "half-stamped" state.

use serde::{Deserialize, Serialize};

pub mod hub;

pub use hub::{EventHub, HubConfig, Subscription};

// ── Payload types ────────────────────────────────────────────────

/// A tool invocation as shown to observers when a batch begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub id: String,
    /// Arguments rendered on a single line.
    pub params: String,
}

/// Decision vocabulary for tool confirmations.
///
/// `TimeoutDeny` is broker-assigned only; clients may never submit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AllowOnce,
    AllowFile,
    AllowDir,
    AllowExecCwd,
    Deny,
    TimeoutDeny,
}

impl Decision {
    /// Whether this decision permits the pending tool call to proceed.
    pub fn allows(self) -> bool {
        !matches!(self, Decision::Deny | Decision::TimeoutDeny)
    }

    /// Parse a client-submitted decision string.
    ///
    /// Returns `None` for unknown values and for `timeout_deny`, which is
    /// reserved for the broker's expiry path.
    pub fn parse_submitted(value: &str) -> Option<Self> {
        match value {
            "allow_once" => Some(Decision::AllowOnce),
            "allow_file" => Some(Decision::AllowFile),
            "allow_dir" => Some(Decision::AllowDir),
            "allow_exec_cwd" => Some(Decision::AllowExecCwd),
            "deny" => Some(Decision::Deny),
            _ => None,
        }
    }
}

// ── Event payloads ───────────────────────────────────────────────

/// Payload of a wire event, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Transport heartbeat. Never carries a `seq`.
    Ping,
    TurnStarted,
    TurnCompleted {
        content: String,
        halted: bool,
    },
    TurnCancelled,
    ContentChunk {
        text: String,
    },
    ThinkingStarted,
    ThinkingEnded {
        duration_ms: u64,
    },
    ToolDetected {
        name: String,
        tool_id: String,
    },
    BatchStarted {
        tools: Vec<ToolSpec>,
    },
    ToolStarted {
        tool_id: String,
    },
    ToolCompleted {
        tool_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    BatchHalted,
    BatchCompleted,
    ConfirmationRequested {
        confirm_id: String,
        tool: String,
        options: Vec<Decision>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_s: Option<u64>,
    },
    ConfirmationResolved {
        confirm_id: String,
        decision: Decision,
        resolved_at: String,
    },
    /// Synthesized by clients and routers when a stream dies; the server
    /// never publishes it on a live bus.
    StreamError {
        error: String,
    },
}

impl EventKind {
    /// Stable label used as the SSE `event:` field.
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Ping => "ping",
            EventKind::TurnStarted => "turn_started",
            EventKind::TurnCompleted { .. } => "turn_completed",
            EventKind::TurnCancelled => "turn_cancelled",
            EventKind::ContentChunk { .. } => "content_chunk",
            EventKind::ThinkingStarted => "thinking_started",
            EventKind::ThinkingEnded { .. } => "thinking_ended",
            EventKind::ToolDetected { .. } => "tool_detected",
            EventKind::BatchStarted { .. } => "batch_started",
            EventKind::ToolStarted { .. } => "tool_started",
            EventKind::ToolCompleted { .. } => "tool_completed",
            EventKind::BatchHalted => "batch_halted",
            EventKind::BatchCompleted => "batch_completed",
            EventKind::ConfirmationRequested { .. } => "confirmation_requested",
            EventKind::ConfirmationResolved { .. } => "confirmation_resolved",
            EventKind::StreamError { .. } => "stream_error",
        }
    }

    /// Whether this is the last event a request ID may carry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::TurnCompleted { .. } | EventKind::TurnCancelled
        )
    }
}

// ── Published event ──────────────────────────────────────────────

/// An event as observed on an agent's bus.
///
/// `agent_id` and `seq` are authoritative: the hub constructs this value at
/// publish time, overwriting anything a caller might have supplied.
/// Heartbeats are the one exception — they are written directly to a single
/// stream, carry no `seq`, and never enter the ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl Event {
    /// A heartbeat for one agent's stream; not published, not sequenced.
    pub fn ping(agent_id: &str) -> Self {
        Self {
            kind: EventKind::Ping,
            agent_id: agent_id.to_string(),
            request_id: None,
            seq: None,
        }
    }
}

/// Restrict an event label to characters safe inside an SSE `event:` line.
///
/// Labels from [`EventKind::label`] already satisfy this; the filter exists
/// so a hostile or corrupted label can never smuggle a newline into the
/// framing.
pub fn sanitize_event_name(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}
