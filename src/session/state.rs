//! Session lifecycle states and the transitions between them.

use std::fmt;

/// Lifecycle of the streaming session.
///
/// `Error` is absorbing until an explicit reconnect or disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Inputs that drive [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `connect()` was called.
    ConnectRequested,
    /// The backend acknowledged the setup message.
    SetupAcknowledged,
    /// The connection closed cleanly.
    TransportClosed,
    /// The connection failed or was lost.
    TransportFailed,
    /// `disconnect()` was called.
    DisconnectRequested,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// Connecting or connected: a new `connect()` is a no-op.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// The session can no longer carry a live turn.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    /// Next state after `transition`.
    pub fn apply(self, transition: Transition) -> Self {
        match (self, transition) {
            (s, Transition::ConnectRequested) if s.is_active() => s,
            (_, Transition::ConnectRequested) => Self::Connecting,
            (Self::Connecting, Transition::SetupAcknowledged) => Self::Connected,
            (s, Transition::SetupAcknowledged) => s,
            (Self::Error, Transition::TransportClosed) => Self::Error,
            (_, Transition::TransportClosed) => Self::Disconnected,
            (_, Transition::TransportFailed) => Self::Error,
            (_, Transition::DisconnectRequested) => Self::Disconnected,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
