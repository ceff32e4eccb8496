//! Configuration types for the realtime assistant session.

use crate::error::{HaloError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Gemini Live bidirectional streaming endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HaloConfig {
    /// Streaming session settings (model, voice, tools).
    pub session: SessionConfig,
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// External task executor settings.
    pub executor: ExecutorConfig,
    /// Video frame forwarding settings.
    pub video: VideoConfig,
}

/// Session settings sent once in the setup message.
///
/// Read-only for the lifetime of a connection; a reconnect rebuilds the
/// setup message from the current values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket endpoint of the realtime backend.
    pub endpoint: String,
    /// API key appended to the endpoint as `key=`.
    ///
    /// When empty, the `GEMINI_API_KEY` environment variable is used.
    pub api_key: String,
    /// Model id, e.g. `models/gemini-2.0-flash-live-001`.
    pub model: String,
    /// Prebuilt voice name.
    pub voice: String,
    /// System instruction text.
    pub system_instruction: String,
    /// Requested response modalities (`AUDIO`, `TEXT`).
    pub response_modalities: Vec<String>,
    /// Description of the `execute` tool presented to the model.
    pub tool_description: String,
    /// Description of the tool's `task` parameter.
    pub task_parameter_description: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            api_key: String::new(),
            model: "models/gemini-2.0-flash-live-001".to_owned(),
            voice: "Aoede".to_owned(),
            system_instruction: "You are a helpful voice assistant. Keep answers short and \
                 conversational. When the user asks you to do something in the world, call \
                 the execute tool with a clear task description."
                .to_owned(),
            response_modalities: vec!["AUDIO".to_owned()],
            tool_description: "Execute a task on the user's behalf (messaging, lists, \
                 reminders, web lookups). Returns the outcome as text."
                .to_owned(),
            task_parameter_description: "A complete, self-contained description of the task \
                 to perform."
                .to_owned(),
        }
    }
}

impl SessionConfig {
    /// The configured API key, or the environment fallback.
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.clone());
        }
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    /// Endpoint URL with the API key attached as a query parameter.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid `ws`/`wss` URL.
    pub fn websocket_url(&self) -> Result<String> {
        let mut url = url::Url::parse(&self.endpoint)
            .map_err(|e| HaloError::Config(format!("invalid endpoint '{}': {e}", self.endpoint)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(HaloError::Config(format!(
                "endpoint must use ws:// or wss://, got '{}'",
                url.scheme()
            )));
        }
        if let Some(key) = self.resolved_api_key() {
            url.query_pairs_mut().append_pair("key", &key);
        }
        Ok(url.into())
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Microphone sample rate in Hz (16-bit mono PCM).
    pub capture_sample_rate: u32,
    /// Speaker sample rate in Hz (16-bit mono PCM).
    pub playback_sample_rate: u32,
    /// Duration of each captured chunk in milliseconds.
    pub chunk_duration_ms: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16_000,
            playback_sample_rate: 24_000,
            chunk_duration_ms: 100,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    /// Bytes per captured chunk: rate × 2 bytes × duration.
    pub fn capture_chunk_bytes(&self) -> usize {
        let samples = u64::from(self.capture_sample_rate) * u64::from(self.chunk_duration_ms) / 1000;
        (samples * 2) as usize
    }

    /// MIME type announced for captured audio.
    pub fn capture_mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.capture_sample_rate)
    }
}

/// External task executor (HTTP gateway) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Gateway URL that accepts `POST {"task": "..."}`. None disables tool execution.
    pub url: Option<String>,
    /// Bearer token for the gateway.
    pub api_key: Option<String>,
    /// HTTP request timeout applied by the executor client.
    pub request_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            request_timeout_secs: 120,
        }
    }
}

/// Video frame forwarding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Whether frames passed to the assistant are forwarded at all.
    pub enabled: bool,
    /// JPEG quality (1-100).
    pub jpeg_quality: u8,
    /// Minimum interval between forwarded frames.
    pub frame_interval_ms: u64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jpeg_quality: 50,
            frame_interval_ms: 1000,
        }
    }
}

impl HaloConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| HaloError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| HaloError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/halo/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| std::env::temp_dir().join("halo-config"))
            .join("halo")
            .join("config.toml")
    }

    /// Reject values that would make the pipelines misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`HaloError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(HaloError::Config("sample rates must be non-zero".into()));
        }
        if self.audio.chunk_duration_ms == 0 {
            return Err(HaloError::Config("chunk_duration_ms must be non-zero".into()));
        }
        if !(1..=100).contains(&self.video.jpeg_quality) {
            return Err(HaloError::Config(format!(
                "jpeg_quality must be within 1..=100, got {}",
                self.video.jpeg_quality
            )));
        }
        if self.session.model.trim().is_empty() {
            return Err(HaloError::Config("session.model must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HaloConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.audio.capture_sample_rate, 16_000);
        assert_eq!(config.audio.playback_sample_rate, 24_000);
        assert_eq!(config.video.jpeg_quality, 50);
        assert_eq!(config.video.frame_interval_ms, 1000);
        assert!(config.executor.url.is_none());
    }

    #[test]
    fn capture_chunk_is_3200_bytes_at_defaults() {
        let audio = AudioConfig::default();
        assert_eq!(audio.capture_chunk_bytes(), 3200);
        assert_eq!(audio.capture_mime_type(), "audio/pcm;rate=16000");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = HaloConfig::default();
        config.session.voice = "Puck".to_owned();
        config.audio.chunk_duration_ms = 40;
        config.executor.url = Some("http://localhost:8080/execute".to_owned());

        config.save_to_file(&path).unwrap();
        let loaded = HaloConfig::from_file(&path).unwrap();

        assert_eq!(loaded.session.voice, "Puck");
        assert_eq!(loaded.audio.chunk_duration_ms, 40);
        assert_eq!(
            loaded.executor.url.as_deref(),
            Some("http://localhost:8080/execute")
        );
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[session]\nvoice = \"Kore\"\n").unwrap();

        let loaded = HaloConfig::from_file(&path).unwrap();
        assert_eq!(loaded.session.voice, "Kore");
        assert_eq!(loaded.session.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(loaded.audio.capture_sample_rate, 16_000);
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();

        assert!(matches!(
            HaloConfig::from_file(&path),
            Err(HaloError::Config(_))
        ));
    }

    #[test]
    fn from_file_nonexistent_returns_io_error() {
        let result = HaloConfig::from_file(Path::new("/nonexistent/halo/config.toml"));
        assert!(matches!(result, Err(HaloError::Io(_))));
    }

    #[test]
    fn validate_rejects_bad_jpeg_quality() {
        let mut config = HaloConfig::default();
        config.video.jpeg_quality = 0;
        assert!(config.validate().is_err());
        config.video.jpeg_quality = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_chunk_duration() {
        let mut config = HaloConfig::default();
        config.audio.chunk_duration_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn websocket_url_appends_key() {
        let session = SessionConfig {
            endpoint: "wss://example.test/live".to_owned(),
            api_key: "secret".to_owned(),
            ..SessionConfig::default()
        };
        assert_eq!(
            session.websocket_url().unwrap(),
            "wss://example.test/live?key=secret"
        );
    }

    #[test]
    fn websocket_url_rejects_http_scheme() {
        let session = SessionConfig {
            endpoint: "https://example.test/live".to_owned(),
            api_key: "secret".to_owned(),
            ..SessionConfig::default()
        };
        assert!(matches!(
            session.websocket_url(),
            Err(HaloError::Config(_))
        ));
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = HaloConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
        assert!(path_str.contains("halo"));
    }
}
