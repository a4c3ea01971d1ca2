//! Session listing, soft deletion and queue bookkeeping.
//!
//! Two independent work lists live on the session records:
//! - the FIFO send queue, whose `queue_position` values stay a dense `1..=N`
//! - the priority queue, sorted by `(priority, priority_order, id)`
//!
//! Every operation re-reads the store instead of trusting earlier reads.

use crate::core::model::{DEFAULT_PRIORITY, Session, priority_ordering};
use crate::error::{Error, Result};
use crate::storage::LocalStore;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

/// Fetch a session or fail with [`Error::SessionNotFound`].
fn require(store: &dyn LocalStore, id: &Uuid) -> Result<Session> {
    store
        .get_session(id)?
        .ok_or_else(|| Error::SessionNotFound(id.to_string()))
}

/// Sessions not marked deleted, most recently modified first.
///
/// # Errors
///
/// Returns an error if the storage backend fails.
pub fn fetch_active(store: &dyn LocalStore) -> Result<Vec<Session>> {
    let mut sessions = store.query_sessions(&|s| !s.marked_deleted)?;
    sessions.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(sessions)
}

/// Sessions in the FIFO queue, front first.
///
/// # Errors
///
/// Returns an error if the storage backend fails.
pub fn fetch_queued(store: &dyn LocalStore) -> Result<Vec<Session>> {
    let mut sessions = store.query_sessions(&|s| s.is_in_queue)?;
    sessions.sort_by_key(|s| s.queue_position);
    Ok(sessions)
}

/// Sessions in the priority queue, most urgent first.
///
/// # Errors
///
/// Returns an error if the storage backend fails.
pub fn fetch_priority_queue(store: &dyn LocalStore) -> Result<Vec<Session>> {
    let mut sessions = store.query_sessions(&|s| s.is_in_priority_queue)?;
    sessions.sort_by(priority_ordering);
    Ok(sessions)
}

/// Highest queue position held by a session other than `exclude`.
fn max_queue_position(store: &dyn LocalStore, exclude: Uuid) -> Result<u32> {
    Ok(store
        .query_sessions(&|s| s.is_in_queue && s.id != exclude)?
        .iter()
        .map(|s| s.queue_position)
        .max()
        .unwrap_or(0))
}

/// Shift every queued session behind `position` one place forward.
fn close_gap(store: &dyn LocalStore, position: u32) -> Result<()> {
    store.update_sessions(
        &|s| s.is_in_queue && s.queue_position > position,
        &|s| s.queue_position -= 1,
    )?;
    Ok(())
}

/// Add a session to the back of the FIFO queue.
///
/// A session that is already queued moves to the back.
///
/// # Errors
///
/// Returns an error if the session does not exist or the storage backend fails.
pub fn enqueue(store: &dyn LocalStore, id: &Uuid) -> Result<()> {
    let session = require(store, id)?;
    if session.is_in_queue {
        close_gap(store, session.queue_position)?;
    }

    let id = *id;
    let position = max_queue_position(store, id)? + 1;
    let now = Utc::now();
    store.update_sessions(&|s| s.id == id, &|s| {
        s.is_in_queue = true;
        s.queue_position = position;
        s.queued_at = Some(now);
    })?;

    debug!(session_id = %id, position, "enqueued session");
    Ok(())
}

/// Remove a session from the FIFO queue, closing the gap it leaves.
///
/// # Errors
///
/// Returns an error if the session does not exist or the storage backend fails.
pub fn dequeue(store: &dyn LocalStore, id: &Uuid) -> Result<()> {
    let session = require(store, id)?;
    if !session.is_in_queue {
        return Ok(());
    }

    let id = *id;
    store.update_sessions(&|s| s.id == id, &|s| {
        s.is_in_queue = false;
        s.queue_position = 0;
        s.queued_at = None;
    })?;
    close_gap(store, session.queue_position)?;

    debug!(session_id = %id, "dequeued session");
    Ok(())
}

/// Highest `priority_order` in a priority bucket, ignoring `exclude`.
fn max_priority_order(store: &dyn LocalStore, priority: i32, exclude: Uuid) -> Result<f64> {
    Ok(store
        .max_session_value(
            &|s| s.is_in_priority_queue && s.priority == priority && s.id != exclude,
            &|s| s.priority_order,
        )?
        .unwrap_or(0.0))
}

/// Add a session to the end of its priority bucket. No-op if already queued.
///
/// # Errors
///
/// Returns an error if the session does not exist or the storage backend fails.
pub fn add_to_priority_queue(store: &dyn LocalStore, id: &Uuid) -> Result<()> {
    let session = require(store, id)?;
    if session.is_in_priority_queue {
        return Ok(());
    }

    let id = *id;
    let order = max_priority_order(store, session.priority, id)? + 1.0;
    let now = Utc::now();
    store.update_sessions(&|s| s.id == id, &|s| {
        s.is_in_priority_queue = true;
        s.priority_order = order;
        s.priority_queued_at = Some(now);
    })?;

    debug!(session_id = %id, priority = session.priority, order, "added to priority queue");
    Ok(())
}

/// Take a session out of the priority queue and reset its priority.
///
/// # Errors
///
/// Returns an error if the session does not exist or the storage backend fails.
pub fn remove_from_priority_queue(store: &dyn LocalStore, id: &Uuid) -> Result<()> {
    require(store, id)?;
    let id = *id;
    store.update_sessions(&|s| s.id == id, &|s| {
        s.is_in_priority_queue = false;
        s.priority = DEFAULT_PRIORITY;
        s.priority_order = 0.0;
        s.priority_queued_at = None;
    })?;
    Ok(())
}

/// Move a queued session to the end of another priority bucket.
///
/// No-op if the session is not in the priority queue or already has `new_priority`.
///
/// # Errors
///
/// Returns an error if the session does not exist or the storage backend fails.
pub fn change_priority(store: &dyn LocalStore, id: &Uuid, new_priority: i32) -> Result<()> {
    let session = require(store, id)?;
    if !session.is_in_priority_queue || session.priority == new_priority {
        return Ok(());
    }

    let id = *id;
    let order = max_priority_order(store, new_priority, id)? + 1.0;
    store.update_sessions(&|s| s.id == id, &|s| {
        s.priority = new_priority;
        s.priority_order = order;
    })?;

    debug!(session_id = %id, from = session.priority, to = new_priority, order, "changed priority");
    Ok(())
}

/// Soft-delete a session, taking it out of both queues.
///
/// # Errors
///
/// Returns an error if the session does not exist or the storage backend fails.
pub fn mark_deleted(store: &dyn LocalStore, id: &Uuid) -> Result<()> {
    dequeue(store, id)?;
    remove_from_priority_queue(store, id)?;
    let id = *id;
    store.update_sessions(&|s| s.id == id, &|s| s.marked_deleted = true)?;
    Ok(())
}

/// Reset a session's unread counter.
///
/// # Errors
///
/// Returns an error if the session does not exist or the storage backend fails.
pub fn mark_read(store: &dyn LocalStore, id: &Uuid) -> Result<()> {
    require(store, id)?;
    let id = *id;
    store.update_sessions(&|s| s.id == id, &|s| s.unread_count = 0)?;
    Ok(())
}

/// Set or clear the user's local name for a session.
///
/// # Errors
///
/// Returns an error if the session does not exist or the storage backend fails.
pub fn rename(store: &dyn LocalStore, id: &Uuid, local_name: Option<&str>) -> Result<()> {
    require(store, id)?;
    let id = *id;
    let local_name = local_name.filter(|n| !n.is_empty()).map(str::to_string);
    store.update_sessions(&|s| s.id == id, &|s| s.local_name.clone_from(&local_name))?;
    Ok(())
}
