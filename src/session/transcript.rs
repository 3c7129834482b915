//! Per-agent transcript — the message log a newly attaching terminal reads
//! to reconstruct the conversation before following live events.
//!
//! Messages are indexed in append order so paginated reads stay stable
//! while turns keep appending. The log lives in memory for the lifetime of
//! the agent; it is not a durable store.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A single transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub index: u64,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<HashMap<String, serde_json::Value>>,
}

/// One page of a transcript read.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptPage {
    pub total: u64,
    pub messages: Vec<TranscriptMessage>,
}

/// Append-only message log, safe to share across handler tasks.
#[derive(Debug)]
pub struct Transcript {
    messages: Mutex<Vec<TranscriptMessage>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Append a plain message; returns its index.
    pub fn append(&self, role: Role, content: impl Into<String>) -> u64 {
        self.append_full(role, content, None, None)
    }

    /// Append a message with tool linkage and metadata.
    pub fn append_full(
        &self,
        role: Role,
        content: impl Into<String>,
        tool_call_id: Option<String>,
        meta: Option<HashMap<String, serde_json::Value>>,
    ) -> u64 {
        let mut messages = self.messages.lock();
        let index = messages.len() as u64;
        messages.push(TranscriptMessage {
            index,
            role,
            content: content.into(),
            tool_call_id,
            meta,
        });
        index
    }

    pub fn len(&self) -> u64 {
        self.messages.lock().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Read up to `limit` messages starting at `offset`.
    ///
    /// An offset at or past the end yields an empty page; `total` always
    /// reflects the full log so callers can detect that case.
    pub fn page(&self, offset: u64, limit: u64) -> TranscriptPage {
        let messages = self.messages.lock();
        let total = messages.len() as u64;
        let start = offset.min(total) as usize;
        let end = offset.saturating_add(limit).min(total) as usize;
        TranscriptPage {
            total,
            messages: messages[start..end].to_vec(),
        }
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}
