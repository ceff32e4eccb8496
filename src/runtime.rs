//! Runtime events emitted by the assistant for UI and observability.
//!
//! Delivered over a broadcast channel so any number of observers can follow
//! along; slow observers may lag but never stall the dispatcher.

use crate::session::SessionState;
use crate::tools::ActiveToolCall;
use crate::transcript::TranscriptEntry;

/// Events that describe what the assistant is doing "right now".
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Session lifecycle moved to a new state.
    StateChanged(SessionState),
    /// The transcript changed; `last` is its newest entry.
    TranscriptUpdated {
        len: usize,
        last: Option<TranscriptEntry>,
    },
    /// A tool call was issued or changed status.
    ToolCallUpdated(ActiveToolCall),
    /// A tool call was withdrawn by the model.
    ToolCallCancelled { call_id: String },
    /// Microphone streaming started or stopped.
    RecordingChanged { active: bool },
    /// A capture or playback device failed. The session stays up.
    AudioError(String),
    /// Decode or transport error reported by the session.
    Error(String),
}
