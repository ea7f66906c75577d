//! Message types for the MessageBus

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::participant::{Participant, Recipient};

/// Errors from bus operations
#[derive(Debug, Error)]
pub enum BusError {
    /// No matching response or error arrived before the deadline
    #[error("Request to {target} timed out after {timeout_ms}ms")]
    Timeout { target: Recipient, timeout_ms: u64 },

    /// The target answered with a `task:error`
    #[error("Request to {target} failed: {message}")]
    Remote {
        target: Recipient,
        message: String,
        payload: Value,
    },

    /// The transient reply listener went away without settling
    #[error("Reply channel closed for correlation id {0}")]
    Closed(String),

    /// A reply cannot be routed back because the original went to `broadcast`
    #[error("Cannot reply to broadcast message {0} without an explicit responder")]
    UnroutableReply(String),

    /// Response payload did not match the requested type
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Result of bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Closed set of message kinds carried by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "task:request")]
    TaskRequest,
    #[serde(rename = "task:response")]
    TaskResponse,
    #[serde(rename = "task:error")]
    TaskError,
    #[serde(rename = "event:test_failed")]
    TestFailed,
    #[serde(rename = "event:test_passed")]
    TestPassed,
    #[serde(rename = "event:dom_changed")]
    DomChanged,
    #[serde(rename = "event:code_modified")]
    CodeModified,
    #[serde(rename = "status:update")]
    StatusUpdate,
    #[serde(rename = "status:query")]
    StatusQuery,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskRequest => "task:request",
            MessageType::TaskResponse => "task:response",
            MessageType::TaskError => "task:error",
            MessageType::TestFailed => "event:test_failed",
            MessageType::TestPassed => "event:test_passed",
            MessageType::DomChanged => "event:dom_changed",
            MessageType::CodeModified => "event:code_modified",
            MessageType::StatusUpdate => "status:update",
            MessageType::StatusQuery => "status:query",
        }
    }

    /// True for the two types that settle a pending request
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::TaskResponse | MessageType::TaskError)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message as stored in the log and delivered to handlers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: Participant,
    pub to: Recipient,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "correlation-id", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// A message before the bus assigns its id and timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub from: Participant,
    pub to: Recipient,
    pub message_type: MessageType,
    pub payload: Value,
    pub correlation_id: Option<String>,
}

impl OutgoingMessage {
    pub fn new(from: Participant, to: impl Into<Recipient>, message_type: MessageType, payload: Value) -> Self {
        Self {
            from,
            to: to.into(),
            message_type,
            payload,
            correlation_id: None,
        }
    }

    /// Fan-out to every participant except `from`
    pub fn broadcast(from: Participant, message_type: MessageType, payload: Value) -> Self {
        Self::new(from, Recipient::Broadcast, message_type, payload)
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Stamp with a fresh id and the current time
    pub(crate) fn stamp(self) -> Message {
        Message {
            id: Uuid::now_v7().to_string(),
            from: self.from,
            to: self.to,
            message_type: self.message_type,
            payload: self.payload,
            timestamp: Utc::now(),
            correlation_id: self.correlation_id,
        }
    }
}

/// Criteria for `MessageBus::get_message_log`; all provided fields must match
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFilter {
    pub from: Option<Participant>,
    pub to: Option<Recipient>,
    pub message_type: Option<MessageType>,
    /// Inclusive lower bound on the message timestamp
    pub since: Option<DateTime<Utc>>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_by(mut self, from: Participant) -> Self {
        self.from = Some(from);
        self
    }

    pub fn sent_to(mut self, to: impl Into<Recipient>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn of_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.from.is_none_or(|from| message.from == from)
            && self.to.is_none_or(|to| message.to == to)
            && self.message_type.is_none_or(|t| message.message_type == t)
            && self.since.is_none_or(|since| message.timestamp >= since)
    }
}

/// Bus metrics for observability
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusMetrics {
    pub messages_published: u64,
    pub deliveries: u64,
    pub handler_failures: u64,
    pub requests_sent: u64,
    pub pending_requests: usize,
    pub request_timeouts: u64,
    pub remote_errors: u64,
}

/// Human-readable form of a `task:error` payload
pub(crate) fn describe_error_payload(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        Value::Object(map) => ["error", "message"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string()),
        other => other.to_string(),
    }
}
