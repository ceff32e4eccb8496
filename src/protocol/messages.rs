//! Outbound wire messages.
//!
//! Every message is one JSON object whose single top-level key names the
//! message kind (`setup`, `clientContent`, `realtimeInput`, `toolResponse`).

use crate::config::SessionConfig;
use base64::Engine;
use serde::Serialize;
use serde_json::json;

/// Name of the single function declared to the model.
pub const EXECUTE_FUNCTION: &str = "execute";

/// Argument of [`EXECUTE_FUNCTION`] carrying the task description.
pub const TASK_ARGUMENT: &str = "task";

/// MIME type of forwarded video frames.
pub const JPEG_MIME: &str = "image/jpeg";

// ── Setup ─────────────────────────────────────────────────────────

/// Session setup, sent exactly once after the connection opens.
#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub tools: Vec<ToolDeclaration>,
    pub realtime_input_config: serde_json::Value,
    pub input_audio_transcription: EmptyObject,
    pub output_audio_transcription: EmptyObject,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// A role-less or role-tagged list of text parts.
#[derive(Debug, Serialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclaration {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Serializes as `{}`.
#[derive(Debug, Default, Serialize)]
pub struct EmptyObject {}

/// Build the setup message for a session.
pub fn build_setup_message(config: &SessionConfig) -> SetupMessage {
    let system_instruction = if config.system_instruction.trim().is_empty() {
        None
    } else {
        Some(Content {
            role: None,
            parts: vec![TextPart {
                text: config.system_instruction.clone(),
            }],
        })
    };

    SetupMessage {
        setup: SetupPayload {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: config.response_modalities.clone(),
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction,
            tools: vec![ToolDeclaration {
                function_declarations: vec![FunctionDeclaration {
                    name: EXECUTE_FUNCTION.to_owned(),
                    description: config.tool_description.clone(),
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "task": {
                                "type": "string",
                                "description": config.task_parameter_description,
                            }
                        },
                        "required": [TASK_ARGUMENT],
                    }),
                }],
            }],
            realtime_input_config: json!({
                "automaticActivityDetection": { "disabled": false },
                "activityHandling": "START_OF_ACTIVITY_INTERRUPTS",
            }),
            input_audio_transcription: EmptyObject::default(),
            output_audio_transcription: EmptyObject::default(),
        },
    }
}

// ── Client content (text turns) ───────────────────────────────────

/// A complete user text turn.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContentMessage {
    pub client_content: ClientContent,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

/// Wire format: `{"clientContent":{"turns":[{"role":"user","parts":[{"text":...}]}],"turnComplete":true}}`
pub fn build_text_message(text: &str) -> ClientContentMessage {
    ClientContentMessage {
        client_content: ClientContent {
            turns: vec![Content {
                role: Some("user".to_owned()),
                parts: vec![TextPart {
                    text: text.to_owned(),
                }],
            }],
            turn_complete: true,
        },
    }
}

// ── Realtime input (media chunks) ─────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

/// Media payload with MIME type and base64-encoded data.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

/// Wire format: `{"realtimeInput":{"mediaChunks":[{"mimeType":...,"data":"<base64>"}]}}`
pub fn build_media_message(mime_type: &str, payload: &[u8]) -> RealtimeInputMessage {
    RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: mime_type.to_owned(),
                data: base64::engine::general_purpose::STANDARD.encode(payload),
            }],
        },
    }
}

/// Signals that the microphone closed so buffered input can be flushed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStreamEndMessage {
    pub realtime_input: AudioStreamEnd,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStreamEnd {
    pub audio_stream_end: bool,
}

pub fn build_audio_stream_end_message() -> AudioStreamEndMessage {
    AudioStreamEndMessage {
        realtime_input: AudioStreamEnd {
            audio_stream_end: true,
        },
    }
}

// ── Tool responses ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponseMessage {
    pub tool_response: ToolResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub response: serde_json::Value,
}

/// Wire format: `{"toolResponse":{"functionResponses":[{"id":...,"response":{...}}]}}`
pub fn build_tool_response(call_id: &str, response: serde_json::Value) -> ToolResponseMessage {
    ToolResponseMessage {
        tool_response: ToolResponse {
            function_responses: vec![FunctionResponse {
                id: call_id.to_owned(),
                response,
            }],
        },
    }
}

/// Success payload: `{"result": content}`.
pub fn success_payload(content: &str) -> serde_json::Value {
    json!({ "result": content })
}

/// Failure payload: `{"error": message}`.
pub fn error_payload(message: &str) -> serde_json::Value {
    json!({ "error": message })
}
