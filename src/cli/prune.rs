//! `sessync prune` command implementation.

use crate::cli::{open_store, parse_session_id};
use crate::config::{Config, PruningConfig};
use crate::core::pruning;
use crate::error::{Error, Result};
use crate::storage::LocalStore;
use uuid::Uuid;

/// Run the prune command.
///
/// With `keep`, cuts the session down to that many messages. Without it,
/// applies the configured retention policy.
///
/// # Errors
///
/// Returns an error if the storage backend fails or the session is not found.
pub fn run(config: &Config, session_id: &str, keep: Option<usize>) -> Result<()> {
    let store = open_store(config)?;
    let id = parse_session_id(session_id)?;
    if store.get_session(&id)?.is_none() {
        return Err(Error::SessionNotFound(session_id.to_string()));
    }

    let removed = prune_session(&store, &id, keep, &config.pruning)?;

    if removed == 0 {
        println!("Nothing to prune.");
    } else {
        println!("Pruned {removed} message(s).");
    }

    Ok(())
}

fn prune_session(
    store: &dyn LocalStore,
    id: &Uuid,
    keep: Option<usize>,
    policy: &PruningConfig,
) -> Result<usize> {
    match keep {
        Some(keep) => pruning::prune(store, id, keep),
        None => pruning::enforce(store, id, policy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Message, MessageRole, Session};
    use crate::storage::{MemoryBackend, MessageChanges};
    use chrono::{Duration, Utc};

    fn session_with_messages(store: &MemoryBackend, count: i64) -> Uuid {
        let session = Session::new(Uuid::new_v4(), "p", "/tmp");
        store.put_session(&session).unwrap();
        let now = Utc::now();
        let upserts = (0..count)
            .map(|i| {
                Message::confirmed(
                    Uuid::new_v4(),
                    session.id,
                    MessageRole::Assistant,
                    &i.to_string(),
                    now + Duration::seconds(i),
                )
            })
            .collect();
        store
            .apply_messages(
                &session.id,
                &MessageChanges {
                    upserts,
                    ..Default::default()
                },
            )
            .unwrap();
        session.id
    }

    #[test]
    fn explicit_keep_prunes_immediately() {
        let store = MemoryBackend::new();
        let id = session_with_messages(&store, 10);

        let removed = prune_session(&store, &id, Some(3), &PruningConfig::default()).unwrap();

        assert_eq!(removed, 7);
        assert_eq!(store.get_messages(&id).unwrap()[0].text, "7");
    }

    #[test]
    fn policy_leaves_small_sessions_alone() {
        let store = MemoryBackend::new();
        let id = session_with_messages(&store, 10);

        let removed = prune_session(&store, &id, None, &PruningConfig::default()).unwrap();

        assert_eq!(removed, 0);
        assert_eq!(store.get_messages(&id).unwrap().len(), 10);
    }

    #[test]
    fn policy_cuts_back_to_soft_cap() {
        let store = MemoryBackend::new();
        let id = session_with_messages(&store, 12);
        let policy = PruningConfig {
            max_messages_per_session: 5,
            prune_threshold: 5,
        };

        assert_eq!(prune_session(&store, &id, None, &policy).unwrap(), 7);
        assert_eq!(store.get_messages(&id).unwrap().len(), 5);
    }
}
