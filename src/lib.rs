//! Halo: realtime voice and vision assistant client.
//!
//! Streams microphone audio and camera frames to a bidirectional Gemini
//! Live session over a websocket and plays back the model's spoken
//! replies. Tasks the model delegates through the `execute` tool are run by
//! an external HTTP executor and answered in-session.
//!
//! # Architecture
//!
//! - **Session**: websocket transport, setup handshake, and the
//!   connection state machine
//! - **Protocol**: outbound message builders and the inbound frame decoder
//! - **Audio**: microphone capture and speaker playback via `cpal`
//! - **Tools**: tool call tracking and the task executor client
//! - **Transcript**: merges streaming transcription into conversation entries
//! - **Pipeline**: a single dispatcher task that applies every event in order

pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod test_utils;
pub mod tools;
pub mod transcript;
pub mod video;

pub use config::HaloConfig;
pub use error::{HaloError, Result};
pub use pipeline::coordinator::AssistantCoordinator;
pub use protocol::ServerEvent;
pub use runtime::RuntimeEvent;
pub use session::{LiveSession, SessionState};
pub use transcript::{Role, TranscriptEntry};
