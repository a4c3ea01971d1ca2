//! In-memory storage backend for testing.

use crate::core::model::{Message, Session};
use crate::error::Result;
use crate::storage::traits::{LocalStore, MessageChanges, SessionRecord};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

/// In-memory storage backend for testing.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<Uuid, SessionRecord>>,
}

impl MemoryBackend {
    /// Create a new in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryBackend {
    fn get_session(&self, id: &Uuid) -> Result<Option<Session>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(id).map(|r| r.session.clone()))
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.values().map(|r| r.session.clone()).collect())
    }

    fn put_session(&self, session: &Session) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records
            .entry(session.id)
            .and_modify(|r| r.session = session.clone())
            .or_insert_with(|| SessionRecord::new(session.clone()));
        Ok(())
    }

    fn update_sessions(
        &self,
        predicate: &dyn Fn(&Session) -> bool,
        apply: &dyn Fn(&mut Session),
    ) -> Result<usize> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = 0;
        for record in records.values_mut() {
            if predicate(&record.session) {
                apply(&mut record.session);
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn delete_session(&self, id: &Uuid) -> Result<()> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.remove(id);
        Ok(())
    }

    fn get_messages(&self, session_id: &Uuid) -> Result<Vec<Message>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .get(session_id)
            .map(|r| r.messages.clone())
            .unwrap_or_default())
    }

    fn apply_messages(
        &self,
        session_id: &Uuid,
        changes: &MessageChanges,
    ) -> Result<Option<Session>> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let Some(record) = records.get_mut(session_id) else {
            return Ok(None);
        };
        record.apply(changes);
        Ok(Some(record.session.clone()))
    }

    fn message_count(&self, session_id: &Uuid) -> Result<usize> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(session_id).map_or(0, |r| r.messages.len()))
    }
}
