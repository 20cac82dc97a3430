//! Inbound events, outbound responses and acknowledgments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Type prefixes that always take the deterministic route.  Events the
/// dispatcher produces for itself carry these, so they can never loop back
/// into the master model.
pub const RESERVED_PREFIXES: [&str; 3] = ["function:", "job:", "llm:"];

fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One external occurrence to be handled.  Identity is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default = "new_event_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_target: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: new_event_id(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
            metadata: None,
            reply_target: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_reply_target(mut self, target: impl Into<String>) -> Self {
        self.reply_target = Some(target.into());
        self
    }

    pub fn is_internal(&self) -> bool {
        RESERVED_PREFIXES
            .iter()
            .any(|prefix| self.event_type.starts_with(prefix))
    }

    /// `metadata.requiresMaster == true`.
    pub fn requires_master(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("requiresMaster"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment {
    pub event_id: String,
    pub status: AckStatus,
    #[serde(default)]
    pub details: Value,
}

impl Acknowledgment {
    pub fn success(event_id: impl Into<String>, result: Value) -> Self {
        Self {
            event_id: event_id.into(),
            status: AckStatus::Success,
            details: json!({ "result": result }),
        }
    }

    pub fn error(event_id: impl Into<String>, kind: &str, message: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            status: AckStatus::Error,
            details: json!({ "error": message.into(), "kind": kind }),
        }
    }

    pub fn pending(event_id: impl Into<String>, reason: &str) -> Self {
        Self {
            event_id: event_id.into(),
            status: AckStatus::Pending,
            details: json!({ "reason": reason }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundResponse {
    pub response_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}
