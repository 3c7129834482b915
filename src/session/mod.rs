//! In-memory conversation state per agent.

pub mod transcript;

pub use transcript::{Role, Transcript, TranscriptMessage, TranscriptPage};
