//! `sessync delete` command implementation.

use crate::cli::{open_store, parse_session_id};
use crate::config::Config;
use crate::core::registry;
use crate::error::{Error, Result};
use crate::storage::LocalStore;
use uuid::Uuid;

/// Run the delete command.
///
/// Soft-deletes by default; `purge` removes the record and its messages.
///
/// # Errors
///
/// Returns an error if the storage backend fails or the session is not found.
pub fn run(config: &Config, session_id: &str, purge: bool) -> Result<()> {
    let store = open_store(config)?;
    let id = parse_session_id(session_id)?;
    delete_session(&store, &id, purge)?;

    if purge {
        println!("Purged session {id}.");
    } else {
        println!("Deleted session {id}.");
    }
    Ok(())
}

fn delete_session(store: &dyn LocalStore, id: &Uuid, purge: bool) -> Result<()> {
    if store.get_session(id)?.is_none() {
        return Err(Error::SessionNotFound(id.to_string()));
    }
    if purge {
        store.delete_session(id)
    } else {
        registry::mark_deleted(store, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Message, Session};
    use crate::storage::{MemoryBackend, MessageChanges};

    fn add_with_message(store: &MemoryBackend) -> Uuid {
        let session = Session::new(Uuid::new_v4(), "d", "/tmp");
        store.put_session(&session).unwrap();
        store
            .apply_messages(
                &session.id,
                &MessageChanges {
                    upserts: vec![Message::optimistic(session.id, "hi")],
                    ..Default::default()
                },
            )
            .unwrap();
        session.id
    }

    #[test]
    fn soft_delete_keeps_record() {
        let store = MemoryBackend::new();
        let id = add_with_message(&store);

        delete_session(&store, &id, false).unwrap();

        let session = store.get_session(&id).unwrap().unwrap();
        assert!(session.marked_deleted);
        assert_eq!(store.get_messages(&id).unwrap().len(), 1);
    }

    #[test]
    fn purge_cascades_to_messages() {
        let store = MemoryBackend::new();
        let id = add_with_message(&store);

        delete_session(&store, &id, true).unwrap();

        assert!(store.get_session(&id).unwrap().is_none());
        assert!(store.get_messages(&id).unwrap().is_empty());
    }

    #[test]
    fn missing_session_is_reported() {
        let store = MemoryBackend::new();
        assert!(matches!(
            delete_session(&store, &Uuid::new_v4(), true),
            Err(Error::SessionNotFound(_))
        ));
    }
}
