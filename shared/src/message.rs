//! Control messages exchanged between the front end, the supervisor and workers.
//!
//! Wire shape: `{"type": "start"|"stop"|"command"|"status"|"error", "user_id", "payload", "timestamp"}`
//! plus an optional `dedup_id` for commands that are not idempotent by nature.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Start,
    Stop,
    Command,
    Status,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub user_id: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_id: Option<String>,
}

impl ControlMessage {
    pub fn new(kind: MessageType, user_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            user_id: user_id.into(),
            payload,
            timestamp: Utc::now(),
            dedup_id: None,
        }
    }

    pub fn start(user_id: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageType::Start, user_id, payload)
    }

    pub fn stop(user_id: impl Into<String>) -> Self {
        Self::new(MessageType::Stop, user_id, Value::Null)
    }

    pub fn command(user_id: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageType::Command, user_id, payload)
    }

    /// Status update: `{"event": .., "data": ..}`
    pub fn status(user_id: impl Into<String>, event: &str, data: Value) -> Self {
        Self::new(MessageType::Status, user_id, json!({ "event": event, "data": data }))
    }

    /// Error report: `{"kind": .., "message": ..}`
    pub fn error(user_id: impl Into<String>, kind: &str, message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            user_id,
            json!({ "kind": kind, "message": message.into() }),
        )
    }

    pub fn with_dedup_id(mut self, dedup_id: impl Into<String>) -> Self {
        self.dedup_id = Some(dedup_id.into());
        self
    }

    /// Attach a fresh random dedup id
    pub fn with_new_dedup_id(self) -> Self {
        self.with_dedup_id(uuid::Uuid::new_v4().to_string())
    }

    /// `event` of a status message, `kind` of an error message
    pub fn event(&self) -> Option<&str> {
        match self.kind {
            MessageType::Status => self.payload.get("event").and_then(Value::as_str),
            MessageType::Error => self.payload.get("kind").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Command name: a bare string payload or `{"command": ..}`
    pub fn command_name(&self) -> Option<&str> {
        self.payload
            .as_str()
            .or_else(|| self.payload.get("command").and_then(Value::as_str))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
