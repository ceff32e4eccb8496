//! Inbound frame decoding.
//!
//! A single server frame can carry several independent signals (for example
//! an output transcription fragment, inline audio, and a turn-complete flag
//! in one `serverContent` frame), so [`decode_frame`] returns every event the
//! frame contains, in a fixed order:
//!
//! 1. `setupComplete`
//! 2. `toolCall` (one event per function call)
//! 3. `toolCallCancellation`
//! 4. `serverContent`: interrupted, input transcription, output
//!    transcription, model-turn parts in order, turn complete
//!
//! Malformed frames yield a single [`ServerEvent::Error`]; frames with no
//! recognized top-level key yield nothing.

use base64::Engine;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// A model-initiated function call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    /// Opaque call id used to correlate the tool response.
    pub id: String,
    /// Function name (the session declares only `execute`).
    pub name: String,
    /// Arguments, stringified when the model sent a non-string value.
    pub args: BTreeMap<String, String>,
}

/// One decoded server signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The backend accepted the setup message.
    SetupComplete,
    /// Decoded PCM audio (24 kHz, 16-bit mono).
    Audio(Vec<u8>),
    /// Plain text fragment from the model turn.
    Text(String),
    /// The model finished its turn.
    TurnComplete,
    /// The model requests a function call.
    ToolCall(ToolCallRequest),
    /// The model withdrew these call ids.
    ToolCallCancellation(Vec<String>),
    /// Transcription fragment of the user's speech.
    InputTranscription(String),
    /// Transcription fragment of the model's speech.
    OutputTranscription(String),
    /// The current model turn was superseded (user barge-in).
    Interrupted,
    /// Decode failure or transport error.
    Error(String),
}

// ── Wire shapes ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    setup_complete: Option<serde_json::Value>,
    tool_call: Option<ToolCallPayload>,
    tool_call_cancellation: Option<ToolCallCancellationPayload>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallPayload {
    #[serde(default)]
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    args: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ToolCallCancellationPayload {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    interrupted: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
    model_turn: Option<ModelTurn>,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

// ── Decoding ──────────────────────────────────────────────────────

/// Decode one inbound JSON frame into zero or more events.
pub fn decode_frame(raw: &str) -> Vec<ServerEvent> {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            return vec![ServerEvent::Error(format!(
                "failed to parse server message: {e}"
            ))];
        }
    };

    if !value.is_object() {
        return vec![ServerEvent::Error(
            "failed to parse server message: expected a JSON object".to_owned(),
        )];
    }

    let frame: InboundFrame = match serde_json::from_value(value) {
        Ok(f) => f,
        Err(e) => {
            return vec![ServerEvent::Error(format!(
                "failed to parse server message: {e}"
            ))];
        }
    };

    let mut events = Vec::new();
    let mut recognized = false;

    if frame.setup_complete.is_some() {
        recognized = true;
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(tool_call) = frame.tool_call {
        recognized = true;
        for call in tool_call.function_calls {
            events.push(ServerEvent::ToolCall(ToolCallRequest {
                id: call.id,
                name: call.name,
                args: stringify_args(call.args),
            }));
        }
    }

    if let Some(cancellation) = frame.tool_call_cancellation {
        recognized = true;
        events.push(ServerEvent::ToolCallCancellation(cancellation.ids));
    }

    if let Some(content) = frame.server_content {
        recognized = true;
        decode_server_content(content, &mut events);
    }

    if !recognized {
        debug!(
            frame = %truncate_for_log(raw, 120),
            "ignoring unrecognized server frame"
        );
    }

    events
}

fn decode_server_content(content: ServerContent, events: &mut Vec<ServerEvent>) {
    if content.interrupted {
        events.push(ServerEvent::Interrupted);
    }

    if let Some(t) = content.input_transcription
        && !t.text.is_empty()
    {
        events.push(ServerEvent::InputTranscription(t.text));
    }

    if let Some(t) = content.output_transcription
        && !t.text.is_empty()
    {
        events.push(ServerEvent::OutputTranscription(t.text));
    }

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(inline) = part.inline_data {
                decode_inline_data(inline, events);
            }
            if let Some(text) = part.text
                && !text.is_empty()
            {
                events.push(ServerEvent::Text(text));
            }
        }
    }

    if content.turn_complete {
        events.push(ServerEvent::TurnComplete);
    }
}

fn decode_inline_data(inline: InlineData, events: &mut Vec<ServerEvent>) {
    if !inline.mime_type.is_empty() && !inline.mime_type.starts_with("audio/") {
        debug!(mime_type = %inline.mime_type, "ignoring non-audio inline data");
        return;
    }
    match base64::engine::general_purpose::STANDARD.decode(inline.data.as_bytes()) {
        Ok(bytes) if !bytes.is_empty() => events.push(ServerEvent::Audio(bytes)),
        Ok(_) => {}
        Err(e) => events.push(ServerEvent::Error(format!(
            "invalid base64 audio payload: {e}"
        ))),
    }
}

fn stringify_args(args: HashMap<String, serde_json::Value>) -> BTreeMap<String, String> {
    args.into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect()
}

fn truncate_for_log(raw: &str, max_chars: usize) -> String {
    if raw.chars().count() <= max_chars {
        raw.to_owned()
    } else {
        let head: String = raw.chars().take(max_chars).collect();
        format!("{head}…")
    }
}
