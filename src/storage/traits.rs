//! Storage trait definitions.

use crate::core::model::{Message, Session};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message-level changes applied to one session in a single atomic step.
#[derive(Debug, Clone, Default)]
pub struct MessageChanges {
    /// Messages to insert, or replace when the identity already exists.
    pub upserts: Vec<Message>,

    /// Identities of messages to delete.
    pub deletes: Vec<Uuid>,

    /// Added to the session's unread count.
    pub unread_increment: u32,
}

impl MessageChanges {
    /// True when applying these changes would not touch any message.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// On-disk shape of a session together with the messages it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: Session,

    #[serde(default)]
    pub messages: Vec<Message>,
}

impl SessionRecord {
    /// Wrap a session with no messages.
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            session,
            messages: Vec::new(),
        }
    }

    /// Apply message changes and refresh the session aggregates.
    ///
    /// Upserts are deduplicated by identity; messages stay in chronological order.
    pub fn apply(&mut self, changes: &MessageChanges) {
        self.messages.retain(|m| !changes.deletes.contains(&m.id));

        for incoming in &changes.upserts {
            match self.messages.iter_mut().find(|m| m.id == incoming.id) {
                Some(existing) => *existing = incoming.clone(),
                None => self.messages.push(incoming.clone()),
            }
        }

        crate::core::model::sort_chronologically(&mut self.messages);
        self.session.refresh_summary(&self.messages);
        self.session.unread_count = self
            .session
            .unread_count
            .saturating_add(changes.unread_increment);
    }
}

/// Durable keyed storage for sessions and their messages.
///
/// Every method observes the latest committed state; readers never see a
/// partially applied [`MessageChanges`].
pub trait LocalStore: Send + Sync {
    /// Fetch a session by identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn get_session(&self, id: &Uuid) -> Result<Option<Session>>;

    /// Fetch every stored session, including soft-deleted ones, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn list_sessions(&self) -> Result<Vec<Session>>;

    /// Create a session, or replace the stored record's session fields.
    ///
    /// Messages owned by an existing session are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn put_session(&self, session: &Session) -> Result<()>;

    /// Mutate every session matching `predicate` in place.
    ///
    /// Only the properties `apply` touches change, so concurrent writers of
    /// other properties are not lost. Returns the number of sessions updated.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn update_sessions(
        &self,
        predicate: &dyn Fn(&Session) -> bool,
        apply: &dyn Fn(&mut Session),
    ) -> Result<usize>;

    /// Delete a session and every message it owns.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn delete_session(&self, id: &Uuid) -> Result<()>;

    /// Fetch a session's messages in ascending timestamp order.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn get_messages(&self, session_id: &Uuid) -> Result<Vec<Message>>;

    /// Atomically apply message changes to a session and refresh its aggregates.
    ///
    /// Returns the updated session, or `None` if the session does not exist
    /// (in which case nothing is written).
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn apply_messages(&self, session_id: &Uuid, changes: &MessageChanges)
    -> Result<Option<Session>>;

    /// Fetch the sessions matching `predicate`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn query_sessions(&self, predicate: &dyn Fn(&Session) -> bool) -> Result<Vec<Session>> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .filter(|s| predicate(s))
            .collect())
    }

    /// Maximum of `value` over the sessions matching `predicate`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn max_session_value(
        &self,
        predicate: &dyn Fn(&Session) -> bool,
        value: &dyn Fn(&Session) -> f64,
    ) -> Result<Option<f64>> {
        Ok(self
            .query_sessions(predicate)?
            .iter()
            .map(value)
            .max_by(f64::total_cmp))
    }

    /// Number of stored messages for a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn message_count(&self, session_id: &Uuid) -> Result<usize> {
        Ok(self.get_messages(session_id)?.len())
    }
}
