//! Session and message records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// Priority assigned to sessions that have never been prioritised.
///
/// Lower numbers sort first.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Maximum length of the cached preview text.
const PREVIEW_LEN: usize = 100;

/// A chat-like session kept in sync with the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Session identity, immutable once assigned.
    pub id: Uuid,

    /// Authoritative display name from the server.
    pub backend_name: String,

    /// Optional user override of the display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_name: Option<String>,

    /// Working directory the session runs in.
    pub working_directory: String,

    /// When the session last changed.
    pub last_modified: DateTime<Utc>,

    /// Number of stored messages.
    pub message_count: usize,

    /// Short text of the most recent message.
    #[serde(default)]
    pub preview: String,

    /// Messages not yet seen by the user.
    #[serde(default)]
    pub unread_count: u32,

    /// True until the backend confirms the session.
    pub is_locally_created: bool,

    /// Soft-delete marker.
    #[serde(default)]
    pub marked_deleted: bool,

    /// FIFO send queue membership.
    #[serde(default)]
    pub is_in_queue: bool,

    /// 1-based position in the FIFO queue, 0 when not queued.
    #[serde(default)]
    pub queue_position: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,

    /// Priority queue membership.
    #[serde(default)]
    pub is_in_priority_queue: bool,

    /// Priority bucket; lower is more urgent.
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Insertion order within the priority bucket.
    #[serde(default)]
    pub priority_order: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_queued_at: Option<DateTime<Utc>>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl Session {
    /// Create a session record with default bookkeeping fields.
    #[must_use]
    pub fn new(id: Uuid, backend_name: &str, working_directory: &str) -> Self {
        Self {
            id,
            backend_name: backend_name.to_string(),
            local_name: None,
            working_directory: working_directory.to_string(),
            last_modified: Utc::now(),
            message_count: 0,
            preview: String::new(),
            unread_count: 0,
            is_locally_created: false,
            marked_deleted: false,
            is_in_queue: false,
            queue_position: 0,
            queued_at: None,
            is_in_priority_queue: false,
            priority: DEFAULT_PRIORITY,
            priority_order: 0.0,
            priority_queued_at: None,
        }
    }

    /// Create a session the user started locally, not yet known to the backend.
    #[must_use]
    pub fn new_local(name: &str, working_directory: &str) -> Self {
        Self {
            is_locally_created: true,
            ..Self::new(Uuid::new_v4(), name, working_directory)
        }
    }

    /// Name shown to the user: the local override when set, otherwise the backend name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        match self.local_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.backend_name,
        }
    }

    /// Recompute the aggregates derived from the stored messages.
    ///
    /// `messages` must be the full stored set, in ascending timestamp order.
    pub fn refresh_summary(&mut self, messages: &[Message]) {
        self.message_count = messages.len();
        if let Some(newest) = messages.last() {
            if newest.timestamp > self.last_modified {
                self.last_modified = newest.timestamp;
            }
            self.preview = preview_text(&newest.text);
        }
    }
}

/// Deterministic ordering used by the priority queue.
///
/// Priority ascending, then insertion order, then identity.
#[must_use]
pub fn priority_ordering(a: &Session, b: &Session) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.priority_order.total_cmp(&b.priority_order))
        .then_with(|| a.id.cmp(&b.id))
}

/// Truncate text to a single-line preview.
fn preview_text(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    if first_line.chars().count() > PREVIEW_LEN {
        let truncated: String = first_line.chars().take(PREVIEW_LEN - 3).collect();
        format!("{truncated}...")
    } else {
        first_line.to_string()
    }
}

/// Author of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    /// Parse the wire role indicator.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" | "human" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Created optimistically, not yet echoed by the backend.
    Sending,

    /// Delivered by the backend.
    #[default]
    Confirmed,

    /// Sending failed.
    Error,
}

/// A single message within a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Message identity, local for optimistic messages, otherwise from the backend.
    pub id: Uuid,

    /// Owning session.
    pub session_id: Uuid,

    pub role: MessageRole,

    pub text: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    /// Create a confirmed message.
    #[must_use]
    pub fn confirmed(
        id: Uuid,
        session_id: Uuid,
        role: MessageRole,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            session_id,
            role,
            text: text.to_string(),
            timestamp,
            status: MessageStatus::Confirmed,
        }
    }

    /// Create an optimistic user message awaiting confirmation.
    #[must_use]
    pub fn optimistic(session_id: Uuid, text: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role: MessageRole::User,
            text: text.to_string(),
            timestamp: Utc::now(),
            status: MessageStatus::Sending,
        }
    }
}

/// Sort messages into chronological display order.
///
/// Ties on timestamp fall back to identity so the order is stable across reads.
pub fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}
