//! Event taxonomy.
//!
//! Fixed kinds are emitted by the connection lifecycle or derived from
//! control messages the client understands. Everything else the backend
//! sends is a [`EventKind::Dynamic`] kind, deliverable only when somebody
//! subscribed to it.

use std::fmt;

use crate::protocol::PreviewImage;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    // Connection lifecycle
    Status,
    Reconnecting,
    Reconnected,
    ConnectionAttempt,

    // Execution lifecycle
    Progress,
    Executing,
    Executed,
    ExecutionStart,
    ExecutionInterrupted,
    ExecutionError,
    ExecutionCached,

    /// Decoded binary preview image.
    Preview,

    // Backend extensions shipped with the SDFX server
    Ping,
    Ready,
    ServerStatus,
    TaskInsert,
    TaskUpdate,
    MonitorStats,

    /// Any other control message type.
    Dynamic(String),
}

impl EventKind {
    /// Every statically known kind.
    pub const FIXED: &'static [EventKind] = &[
        Self::Status,
        Self::Reconnecting,
        Self::Reconnected,
        Self::ConnectionAttempt,
        Self::Progress,
        Self::Executing,
        Self::Executed,
        Self::ExecutionStart,
        Self::ExecutionInterrupted,
        Self::ExecutionError,
        Self::ExecutionCached,
        Self::Preview,
        Self::Ping,
        Self::Ready,
        Self::ServerStatus,
        Self::TaskInsert,
        Self::TaskUpdate,
        Self::MonitorStats,
    ];

    /// Resolve a wire name. Unknown names become [`EventKind::Dynamic`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "status" => Self::Status,
            "reconnecting" => Self::Reconnecting,
            "reconnected" => Self::Reconnected,
            "connectionAttempt" => Self::ConnectionAttempt,
            "progress" => Self::Progress,
            "executing" => Self::Executing,
            "executed" => Self::Executed,
            "execution_start" => Self::ExecutionStart,
            "execution_interrupted" => Self::ExecutionInterrupted,
            "execution_error" => Self::ExecutionError,
            "execution_cached" => Self::ExecutionCached,
            "preview" => Self::Preview,
            "ping" => Self::Ping,
            "ready" => Self::Ready,
            "sdfx-server-status" => Self::ServerStatus,
            "sdfx-task-insert" => Self::TaskInsert,
            "sdfx-task-update" => Self::TaskUpdate,
            "crystools.monitor" => Self::MonitorStats,
            other => Self::Dynamic(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Status => "status",
            Self::Reconnecting => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::ConnectionAttempt => "connectionAttempt",
            Self::Progress => "progress",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::ExecutionStart => "execution_start",
            Self::ExecutionInterrupted => "execution_interrupted",
            Self::ExecutionError => "execution_error",
            Self::ExecutionCached => "execution_cached",
            Self::Preview => "preview",
            Self::Ping => "ping",
            Self::Ready => "ready",
            Self::ServerStatus => "sdfx-server-status",
            Self::TaskInsert => "sdfx-task-insert",
            Self::TaskUpdate => "sdfx-task-update",
            Self::MonitorStats => "crystools.monitor",
            Self::Dynamic(name) => name,
        }
    }

    pub fn is_fixed(&self) -> bool {
        !matches!(self, Self::Dynamic(_))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        Self::from_name(name)
    }
}

impl From<String> for EventKind {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

/// Event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Empty,
    Json(serde_json::Value),
    Preview(PreviewImage),
}

impl EventData {
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_preview(&self) -> Option<&PreviewImage> {
        match self {
            Self::Preview(image) => Some(image),
            _ => None,
        }
    }
}

/// A dispatchable event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    /// Segment of the control message this event came from, if any.
    pub segment: Option<String>,
    pub data: EventData,
}

impl Event {
    pub fn new(kind: impl Into<EventKind>, data: EventData) -> Self {
        Self {
            kind: kind.into(),
            segment: None,
            data,
        }
    }

    pub fn json(kind: impl Into<EventKind>, value: serde_json::Value) -> Self {
        Self::new(kind, EventData::Json(value))
    }

    pub fn empty(kind: impl Into<EventKind>) -> Self {
        Self::new(kind, EventData::Empty)
    }

    pub fn preview(image: PreviewImage) -> Self {
        Self::new(EventKind::Preview, EventData::Preview(image))
    }

    pub fn connection_attempt(attempt: u32) -> Self {
        Self::json(EventKind::ConnectionAttempt, serde_json::json!(attempt))
    }

    pub fn with_segment(mut self, segment: Option<String>) -> Self {
        self.segment = segment;
        self
    }
}
