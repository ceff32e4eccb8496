//! Error types for the halo session client.

/// Top-level error type for the assistant client.
#[derive(Debug, thiserror::Error)]
pub enum HaloError {
    /// Connection refused, lost, or otherwise unusable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected wire message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// External task executor error.
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// An operation required a connected session.
    #[error("session is not connected (state: {0})")]
    NotConnected(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HaloError {
    /// Whether this error ends the session. Only transport failures do;
    /// everything else is recovered locally.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Failures reported by the external task executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// No executor endpoint was configured.
    #[error("task executor is not configured")]
    NotConfigured,

    /// The request never produced a response.
    #[error("request failed: {0}")]
    Request(String),

    /// The gateway answered with a non-success HTTP status.
    #[error("gateway returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The gateway answered but reported the task as unsuccessful.
    #[error("task rejected: {0}")]
    Rejected(String),

    /// The response body could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, HaloError>;
