//! Conversation transcript.
//!
//! Streaming transcription fragments grow the last entry of the same role
//! until something finalizes it. One-shot messages always land as new,
//! already-finalized entries. Plain model text is buffered separately and
//! flushed as one assistant entry at the end of the turn.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Who an entry is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub text: String,
    /// Sealed entries never receive further text.
    pub finalized: bool,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    fn new(role: Role, text: String, finalized: bool) -> Self {
        Self {
            role,
            text,
            finalized,
            timestamp: Utc::now(),
        }
    }
}

/// Ordered transcript plus the pending plain-text buffer.
#[derive(Debug, Default, Clone)]
pub struct TranscriptAggregator {
    entries: Vec<TranscriptEntry>,
    text_buffer: String,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// Append a streaming transcription fragment.
    pub fn append_fragment(&mut self, role: Role, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        match self.entries.last_mut() {
            Some(last) if last.role == role && !last.finalized => last.text.push_str(fragment),
            _ => self
                .entries
                .push(TranscriptEntry::new(role, fragment.to_owned(), false)),
        }
    }

    /// Append a complete, finalized entry.
    pub fn add_message(&mut self, role: Role, text: impl Into<String>) {
        self.entries
            .push(TranscriptEntry::new(role, text.into(), true));
    }

    /// Buffer a plain-text model fragment until the turn completes.
    pub fn push_text(&mut self, fragment: &str) {
        self.text_buffer.push_str(fragment);
    }

    /// Seal the live entry and flush buffered text. Returns whether the
    /// transcript changed.
    pub fn on_turn_complete(&mut self) -> bool {
        let mut changed = self.seal_open();
        if !self.text_buffer.is_empty() {
            let text = std::mem::take(&mut self.text_buffer);
            self.entries
                .push(TranscriptEntry::new(Role::Assistant, text, true));
            changed = true;
        }
        changed
    }

    /// Drop buffered text and seal the live entry.
    pub fn on_interrupted(&mut self) -> bool {
        self.text_buffer.clear();
        self.seal_open()
    }

    /// Seal the live entry when the session goes away.
    pub fn on_session_ended(&mut self) -> bool {
        self.seal_open()
    }

    /// Seal every open entry. Normally only the last one is open, but a
    /// one-shot message can land behind a live entry.
    fn seal_open(&mut self) -> bool {
        let mut changed = false;
        for entry in self.entries.iter_mut().rev().filter(|e| !e.finalized) {
            entry.finalized = true;
            changed = true;
        }
        changed
    }
}
