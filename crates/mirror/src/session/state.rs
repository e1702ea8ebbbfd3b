//! Session state machine

use serde::Serialize;

/// Lifecycle of a mirroring session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session has run yet
    Idle,
    /// Waiting for a device to be picked and opened
    RequestingDevice,
    /// Bridge handshake in progress
    Connecting,
    /// The device challenged the host key
    Authenticating,
    /// Launching the capture service
    NegotiatingCapture,
    /// Frames are flowing
    Streaming,
    /// Releasing resources
    Stopping,
    Stopped,
    /// A fatal error ended the session
    Error,
}

impl SessionState {
    /// Whether `start()` is accepted in this state
    pub fn can_start(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Stopped | SessionState::Error
        )
    }

    /// No further transitions happen without a new `start()`
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Error)
    }

    /// Whether the driver may move from `self` to `next`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle | Stopped | Error, RequestingDevice) => true,
            (RequestingDevice, Connecting) => true,
            (Connecting, Authenticating | NegotiatingCapture) => true,
            (Authenticating, NegotiatingCapture) => true,
            (NegotiatingCapture, Streaming) => true,
            (Stopping, Stopped) => true,
            (Stopping | Stopped | Idle | Error, Error) => false,
            (_, Error) => true,
            (Stopped | Stopping, Stopping) => false,
            (_, Stopping) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::RequestingDevice => write!(f, "Requesting device"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Authenticating => write!(f, "Authenticating"),
            SessionState::NegotiatingCapture => write!(f, "Negotiating capture"),
            SessionState::Streaming => write!(f, "Streaming"),
            SessionState::Stopping => write!(f, "Stopping"),
            SessionState::Stopped => write!(f, "Stopped"),
            SessionState::Error => write!(f, "Error"),
        }
    }
}
