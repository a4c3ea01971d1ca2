//! Wire protocol between the client and the backend.
//!
//! Inbound frames are decoded into [`InboundMessage`] at the transport
//! boundary; nothing past this module handles untyped JSON except the
//! per-item history entries, which are parsed tolerantly so one bad item
//! never costs the rest of a batch.

use crate::core::model::MessageRole;
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Frames pushed by the backend.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Handshake accepted; the connection is authenticated.
    Connected {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },

    /// Handshake rejected; credentials must be refreshed before reconnecting.
    AuthError {
        #[serde(default)]
        message: String,
    },

    /// Application-level liveness signal.
    Heartbeat {
        #[serde(default)]
        timestamp: Option<String>,
    },

    Pong,

    /// Full or delta history batch for one session.
    SessionHistory {
        session_id: String,
        #[serde(default)]
        messages: Vec<Value>,
    },

    SessionCreated {
        session_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        working_directory: Option<String>,
    },

    SessionList {
        #[serde(default)]
        sessions: Vec<Value>,
    },

    SessionLocked {
        session_id: String,
    },

    /// The session finished its turn and accepts prompts again.
    TurnComplete {
        session_id: String,
    },

    CommandStarted {
        command_session_id: String,
        #[serde(default)]
        shell_command: Option<String>,
    },

    /// Incremental output chunk of a running command.
    CommandOutput {
        command_session_id: String,
        #[serde(default)]
        stream: Option<String>,
        #[serde(default)]
        text: String,
    },

    CommandComplete {
        command_session_id: String,
        #[serde(default)]
        exit_code: Option<i32>,
    },

    /// Complete output of a finished command, replacing any streamed chunks.
    CommandOutputFull {
        command_session_id: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        exit_code: Option<i32>,
    },

    CommandHistory {
        #[serde(default)]
        sessions: Vec<Value>,
    },

    #[serde(rename = "error")]
    ServerError {
        #[serde(default)]
        message: String,
        #[serde(default)]
        session_id: Option<String>,
    },

    Ack {
        #[serde(default)]
        message: Option<String>,
    },

    /// Any frame type this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Decode one inbound text frame.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the frame is not a recognizable message.
pub fn decode(text: &str) -> Result<InboundMessage> {
    serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))
}

/// Frames sent to the backend.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Handshake frame sent as soon as the transport opens.
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },

    Ping,

    /// Subscribe to a session's history; `last_message_id` requests a delta.
    Subscribe {
        session_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_message_id: Option<Uuid>,
    },

    Unsubscribe {
        session_id: Uuid,
    },

    Prompt {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_session_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        resume_session_id: Option<Uuid>,
        working_directory: String,
    },

    SetDirectory {
        path: String,
    },
}

/// Whether a prompt starts a new backend session or continues one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTarget {
    New(Uuid),
    Resume(Uuid),
}

impl OutboundMessage {
    /// Build a prompt frame.
    #[must_use]
    pub fn prompt(text: &str, target: PromptTarget, working_directory: &str) -> Self {
        let (new_session_id, resume_session_id) = match target {
            PromptTarget::New(id) => (Some(id), None),
            PromptTarget::Resume(id) => (None, Some(id)),
        };
        Self::Prompt {
            text: text.to_string(),
            new_session_id,
            resume_session_id,
            working_directory: working_directory.to_string(),
        }
    }

    /// Whether the frame must wait until the connection is authenticated.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Self::Connect { .. } | Self::Ping)
    }

    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A history item that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub role: MessageRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawHistoryEntry {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    message: Option<RawMessageBody>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessageBody {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<RawContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl RawContent {
    /// Text of the `text` blocks; tool invocations and other blocks are ignored.
    fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Parse one element of a `session_history` batch.
///
/// # Errors
///
/// Returns [`Error::Protocol`] describing why the entry was rejected.
pub fn parse_history_entry(value: &Value) -> Result<HistoryEntry> {
    let raw: RawHistoryEntry = serde_json::from_value(value.clone())
        .map_err(|e| Error::Protocol(format!("malformed history entry: {e}")))?;

    let id = raw
        .uuid
        .as_deref()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| Error::Protocol(format!("missing or invalid uuid: {:?}", raw.uuid)))?;

    let timestamp = raw
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .ok_or_else(|| {
            Error::Protocol(format!("missing or invalid timestamp: {:?}", raw.timestamp))
        })?;

    let role = raw
        .kind
        .as_deref()
        .and_then(MessageRole::parse)
        .or_else(|| {
            raw.message
                .as_ref()
                .and_then(|m| m.role.as_deref())
                .and_then(MessageRole::parse)
        })
        .ok_or_else(|| Error::Protocol(format!("unsupported role: {:?}", raw.kind)))?;

    let text = raw
        .message
        .as_ref()
        .and_then(|m| m.content.as_ref())
        .map(RawContent::text)
        .unwrap_or_default();

    Ok(HistoryEntry {
        id,
        role,
        text,
        timestamp,
    })
}

/// Parse an ISO-8601 timestamp, with or without fractional seconds.
///
/// Timestamps without an offset are taken as UTC.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Session fields carried by `session_created` and `session_list` entries.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub message_count: Option<usize>,
    #[serde(default)]
    pub preview: Option<String>,
}

impl SessionInfo {
    /// Parse one element of a `session_list` payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the entry lacks a session id.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Protocol(format!("malformed session entry: {e}")))
    }
}
