//! Orchestrator socket wire protocol.

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::error::{ConnectivityError, Result};

/// Event types the orchestrator socket dispatches to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PlanAdded,
    PlanUpdated,
    PlanDeleted,
    StubAdded,
    StubUpdated,
    StubDeleted,
    WorkorderAdded,
    WorkorderUpdated,
    WorkorderDeleted,
    ProjectAdded,
    ProjectRemoved,
}

impl EventKind {
    pub const ALL: [Self; 11] = [
        Self::PlanAdded,
        Self::PlanUpdated,
        Self::PlanDeleted,
        Self::StubAdded,
        Self::StubUpdated,
        Self::StubDeleted,
        Self::WorkorderAdded,
        Self::WorkorderUpdated,
        Self::WorkorderDeleted,
        Self::ProjectAdded,
        Self::ProjectRemoved,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlanAdded => "plan_added",
            Self::PlanUpdated => "plan_updated",
            Self::PlanDeleted => "plan_deleted",
            Self::StubAdded => "stub_added",
            Self::StubUpdated => "stub_updated",
            Self::StubDeleted => "stub_deleted",
            Self::WorkorderAdded => "workorder_added",
            Self::WorkorderUpdated => "workorder_updated",
            Self::WorkorderDeleted => "workorder_deleted",
            Self::ProjectAdded => "project_added",
            Self::ProjectRemoved => "project_removed",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recognized orchestrator event.
///
/// `payload` keeps the full JSON object so subscribers can read fields this
/// crate does not model.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorEvent {
    pub kind: EventKind,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub project_path: Option<String>,
    pub feature_name: Option<String>,
    pub timestamp: Option<String>,
    pub payload: Value,
}

impl OrchestratorEvent {
    fn from_object(kind: EventKind, object: &Map<String, Value>) -> Self {
        let field = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .map(ToString::to_string)
        };
        Self {
            kind,
            file_path: field("file_path"),
            file_name: field("file_name"),
            project_path: field("project_path"),
            feature_name: field("feature_name"),
            timestamp: field("timestamp"),
            payload: Value::Object(object.clone()),
        }
    }
}

/// Parsed inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Ping,
    Event(OrchestratorEvent),
    /// Well-formed frame whose `type` this client does not recognize.
    Unknown(String),
}

/// Parse one inbound text frame.
///
/// Errors cover frames that are not JSON objects or lack a string `type`.
pub fn parse_frame(text: &str) -> Result<InboundFrame> {
    let value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object()
        .ok_or_else(|| ConnectivityError::Protocol("expected JSON object frame".to_string()))?;
    let frame_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectivityError::Protocol("missing frame type".to_string()))?;

    if frame_type == "ping" {
        return Ok(InboundFrame::Ping);
    }
    Ok(match EventKind::from_wire(frame_type) {
        Some(kind) => InboundFrame::Event(OrchestratorEvent::from_object(kind, object)),
        None => InboundFrame::Unknown(frame_type.to_string()),
    })
}

/// Heartbeat reply frame.
pub fn pong_frame() -> String {
    json!({ "type": "pong" }).to_string()
}
