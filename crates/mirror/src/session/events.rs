//! Events emitted to the session observer

use crate::session::state::SessionState;
use common::MirrorError;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Success => write!(f, "success"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// One observable step of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEvent {
    pub severity: Severity,
    pub message: String,
    /// State entered, for transition events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<SessionState>,
    /// Error kind, for error events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl SessionEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
            state: None,
            error: None,
        }
    }

    /// Event for entering `state`
    pub fn transition(state: SessionState, message: impl Into<String>) -> Self {
        let severity = match state {
            SessionState::Streaming => Severity::Success,
            _ => Severity::Info,
        };
        Self {
            severity,
            message: message.into(),
            state: Some(state),
            error: None,
        }
    }

    /// Event for entering `Error` because of `error`
    pub fn failure(error: &MirrorError) -> Self {
        Self {
            severity: Severity::Error,
            message: error.to_string(),
            state: Some(SessionState::Error),
            error: Some(error.kind()),
        }
    }
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)
    }
}

/// Observer receiving every session event
pub type EventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;
