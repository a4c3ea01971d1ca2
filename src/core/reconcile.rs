//! Merge server-reported history into the local store.
//!
//! A batch only ever adds messages or confirms optimistic ones. An empty
//! batch is a delta with nothing new, never a signal that the session
//! emptied, so it leaves the cache untouched.

use crate::core::model::{Message, MessageRole, MessageStatus};
use crate::error::Result;
use crate::protocol::{HistoryEntry, parse_history_entry};
use crate::storage::{LocalStore, MessageChanges};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// What a reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Messages materialized for the first time.
    pub inserted: usize,

    /// Optimistic messages moved from `sending` to `confirmed`.
    pub confirmed: usize,

    /// Entries already stored and left untouched.
    pub unchanged: usize,

    /// Entries dropped because they could not be parsed.
    pub skipped: usize,
}

/// Reconcile a batch of wire history entries into one session.
///
/// Unknown or unparseable session identifiers are a logged no-op.
///
/// # Errors
///
/// Returns an error only if the storage backend fails.
pub fn reconcile(
    store: &dyn LocalStore,
    session_id: &str,
    incoming: &[Value],
) -> Result<ReconcileOutcome> {
    let Ok(session_uuid) = Uuid::parse_str(session_id) else {
        warn!(session_id, "ignoring history for unparseable session id");
        return Ok(ReconcileOutcome::default());
    };

    if store.get_session(&session_uuid)?.is_none() {
        warn!(%session_uuid, "ignoring history for unknown session");
        return Ok(ReconcileOutcome::default());
    }

    if incoming.is_empty() {
        debug!(%session_uuid, "empty history batch, cache left as is");
        return Ok(ReconcileOutcome::default());
    }

    let mut entries = Vec::with_capacity(incoming.len());
    let mut outcome = ReconcileOutcome::default();
    for value in incoming {
        match parse_history_entry(value) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!(%session_uuid, error = %e, "dropping history entry");
                outcome.skipped += 1;
            }
        }
    }

    let existing = store.get_messages(&session_uuid)?;
    let (changes, merged) = plan_changes(session_uuid, &existing, &entries);
    outcome.inserted = merged.inserted;
    outcome.confirmed = merged.confirmed;
    outcome.unchanged = merged.unchanged;

    if store.apply_messages(&session_uuid, &changes)?.is_none() {
        // Session went away while the batch was being merged
        debug!(%session_uuid, "session removed during reconciliation, discarding batch");
        return Ok(ReconcileOutcome {
            skipped: outcome.skipped,
            ..Default::default()
        });
    }

    debug!(
        %session_uuid,
        inserted = outcome.inserted,
        confirmed = outcome.confirmed,
        unchanged = outcome.unchanged,
        skipped = outcome.skipped,
        "reconciled history batch"
    );
    Ok(outcome)
}

/// Work out the store changes for a batch of parsed entries.
fn plan_changes(
    session_id: Uuid,
    existing: &[Message],
    entries: &[HistoryEntry],
) -> (MessageChanges, ReconcileOutcome) {
    let mut changes = MessageChanges::default();
    let mut outcome = ReconcileOutcome::default();
    let mut seen: HashSet<Uuid> = HashSet::new();
    // Optimistic messages already matched by text in this batch
    let mut claimed: HashSet<Uuid> = HashSet::new();

    for entry in entries {
        if !seen.insert(entry.id) {
            outcome.unchanged += 1;
            continue;
        }

        if let Some(stored) = existing.iter().find(|m| m.id == entry.id) {
            if stored.status == MessageStatus::Sending {
                changes.upserts.push(Message {
                    status: MessageStatus::Confirmed,
                    ..stored.clone()
                });
                outcome.confirmed += 1;
            } else {
                outcome.unchanged += 1;
            }
            continue;
        }

        let optimistic = existing.iter().find(|m| {
            m.status == MessageStatus::Sending
                && m.role == entry.role
                && m.text == entry.text
                && !claimed.contains(&m.id)
        });

        if let Some(local) = optimistic {
            // Replace the local identity with the server's so later batches dedup by id
            claimed.insert(local.id);
            changes.deletes.push(local.id);
            changes.upserts.push(Message::confirmed(
                entry.id,
                session_id,
                entry.role,
                &entry.text,
                entry.timestamp,
            ));
            outcome.confirmed += 1;
            continue;
        }

        changes.upserts.push(Message::confirmed(
            entry.id,
            session_id,
            entry.role,
            &entry.text,
            entry.timestamp,
        ));
        if entry.role == MessageRole::Assistant {
            changes.unread_increment += 1;
        }
        outcome.inserted += 1;
    }

    (changes, outcome)
}
