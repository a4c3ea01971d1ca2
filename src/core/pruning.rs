//! Bounded per-session message retention.
//!
//! Pruning only starts once a session holds `max_messages_per_session +
//! prune_threshold` messages, then cuts back to the soft cap, so a busy
//! session is not pruned on every new message.

use crate::config::PruningConfig;
use crate::error::Result;
use crate::storage::{LocalStore, MessageChanges};
use tracing::info;
use uuid::Uuid;

/// Check whether a session has grown past the pruning threshold.
///
/// # Errors
///
/// Returns an error if the storage backend fails.
pub fn needs_pruning(
    store: &dyn LocalStore,
    session_id: &Uuid,
    config: &PruningConfig,
) -> Result<bool> {
    let count = store.message_count(session_id)?;
    Ok(count >= config.max_messages_per_session + config.prune_threshold)
}

/// Delete the oldest messages until exactly `keep_count` remain.
///
/// Returns the number of messages deleted.
///
/// # Errors
///
/// Returns an error if the storage backend fails.
pub fn prune(store: &dyn LocalStore, session_id: &Uuid, keep_count: usize) -> Result<usize> {
    let messages = store.get_messages(session_id)?;
    if messages.len() <= keep_count {
        return Ok(0);
    }

    let excess = messages.len() - keep_count;
    let changes = MessageChanges {
        deletes: messages.iter().take(excess).map(|m| m.id).collect(),
        ..Default::default()
    };

    if store.apply_messages(session_id, &changes)?.is_none() {
        return Ok(0);
    }

    info!(%session_id, deleted = excess, kept = keep_count, "pruned session history");
    Ok(excess)
}

/// Prune a session back to the soft cap if it crossed the threshold.
///
/// # Errors
///
/// Returns an error if the storage backend fails.
pub fn enforce(store: &dyn LocalStore, session_id: &Uuid, config: &PruningConfig) -> Result<usize> {
    if needs_pruning(store, session_id, config)? {
        prune(store, session_id, config.max_messages_per_session)
    } else {
        Ok(0)
    }
}
