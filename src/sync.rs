//! Session sync orchestration.
//!
//! Routes forwarded sync messages into the reconciler and the registry, and
//! issues subscribe/prompt requests carrying the delta-sync cursor read from
//! the local store.

use crate::config::{Config, PruningConfig};
use crate::connection::WeakConnectionHandle;
use crate::core::model::{Message, MessageStatus, Session};
use crate::core::{ReconcileOutcome, pruning, reconcile, registry};
use crate::error::{Error, Result};
use crate::protocol::{InboundMessage, OutboundMessage, PromptTarget, SessionInfo, parse_timestamp};
use crate::storage::{LocalStore, MessageChanges};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Keeps the local store in step with the backend.
///
/// Holds a non-owning handle to the connection; the application owns the
/// connection's lifetime.
pub struct SessionSyncManager {
    store: Arc<dyn LocalStore>,
    connection: WeakConnectionHandle,
    pruning: PruningConfig,
    default_working_directory: String,
    subscriptions: Mutex<BTreeSet<Uuid>>,
}

impl SessionSyncManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn LocalStore>,
        connection: WeakConnectionHandle,
        pruning: PruningConfig,
        default_working_directory: &str,
    ) -> Self {
        Self {
            store,
            connection,
            pruning,
            default_working_directory: default_working_directory.to_string(),
            subscriptions: Mutex::new(BTreeSet::new()),
        }
    }

    /// Build a manager from the loaded configuration.
    #[must_use]
    pub fn from_config(
        store: Arc<dyn LocalStore>,
        connection: WeakConnectionHandle,
        config: &Config,
    ) -> Self {
        Self::new(
            store,
            connection,
            config.pruning,
            &config.session.default_working_directory,
        )
    }

    #[must_use]
    pub fn store(&self) -> &dyn LocalStore {
        self.store.as_ref()
    }

    /// Sessions currently subscribed to, in identity order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Delta-sync cursor: the newest message the backend has confirmed.
    ///
    /// Optimistic messages carry local identities the backend has never seen,
    /// so they are not used as a cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn last_message_id(&self, session_id: &Uuid) -> Result<Option<Uuid>> {
        Ok(self
            .store
            .get_messages(session_id)?
            .iter()
            .rev()
            .find(|m| m.status == MessageStatus::Confirmed)
            .map(|m| m.id))
    }

    /// Subscribe to a session, requesting only what is newer than the cache.
    ///
    /// The subscription is remembered and re-sent with a fresh cursor after
    /// every reconnect.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the connection is gone.
    pub fn subscribe(&self, session_id: Uuid) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id);
        self.send_subscribe(session_id)
    }

    fn send_subscribe(&self, session_id: Uuid) -> Result<()> {
        let last_message_id = self.last_message_id(&session_id)?;
        debug!(%session_id, ?last_message_id, "subscribing");
        self.connection.send(OutboundMessage::Subscribe {
            session_id,
            last_message_id,
        })
    }

    /// Stop receiving updates for a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is gone.
    pub fn unsubscribe(&self, session_id: Uuid) -> Result<()> {
        let was_subscribed = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
        if !was_subscribed {
            return Ok(());
        }
        self.connection
            .send(OutboundMessage::Unsubscribe { session_id })
    }

    /// Re-send every remembered subscription after authentication.
    fn resubscribe_all(&self) {
        for session_id in self.subscriptions() {
            if let Err(e) = self.send_subscribe(session_id) {
                warn!(%session_id, error = %e, "failed to resubscribe");
            }
        }
    }

    /// Merge a history batch off the owner loop, then enforce retention.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub async fn handle_session_history(
        &self,
        session_id: String,
        messages: Vec<Value>,
    ) -> Result<ReconcileOutcome> {
        let store = Arc::clone(&self.store);
        let pruning = self.pruning;
        tokio::task::spawn_blocking(move || -> Result<ReconcileOutcome> {
            let outcome = reconcile(store.as_ref(), &session_id, &messages)?;
            if outcome.inserted > 0 {
                if let Ok(id) = Uuid::parse_str(&session_id) {
                    pruning::enforce(store.as_ref(), &id, &pruning)?;
                }
            }
            Ok(outcome)
        })
        .await
        .map_err(|e| Error::InvalidState(format!("reconciliation task failed: {e}")))?
    }

    /// Upsert a session announced by the backend.
    ///
    /// Returns the stored session, or `None` if the identifier is unusable or
    /// an unknown session arrives without a name and working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn handle_session_created(
        &self,
        session_id: &str,
        name: Option<&str>,
        working_directory: Option<&str>,
    ) -> Result<Option<Session>> {
        self.merge_session_info(&SessionInfo {
            session_id: session_id.to_string(),
            name: name.map(str::to_string),
            working_directory: working_directory.map(str::to_string),
            last_modified: None,
            message_count: None,
            preview: None,
        })
    }

    /// Upsert every session in a `session_list` payload.
    ///
    /// Returns the number of sessions stored; malformed entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn handle_session_list(&self, sessions: &[Value]) -> Result<usize> {
        let mut stored = 0;
        for value in sessions {
            match SessionInfo::from_value(value) {
                Ok(info) => {
                    if self.merge_session_info(&info)?.is_some() {
                        stored += 1;
                    }
                }
                Err(e) => warn!(error = %e, "dropping session list entry"),
            }
        }
        info!(stored, total = sessions.len(), "applied session list");
        Ok(stored)
    }

    /// Property-level merge of server fields into the local record.
    ///
    /// Server values win where present. Cached aggregates derived from
    /// stored messages are only taken from the server while nothing is cached.
    /// A session not stored yet is only created from a complete announcement.
    fn merge_session_info(&self, info: &SessionInfo) -> Result<Option<Session>> {
        let Ok(id) = Uuid::parse_str(&info.session_id) else {
            warn!(session_id = %info.session_id, "ignoring session with unparseable id");
            return Ok(None);
        };
        let last_modified = info.last_modified.as_deref().and_then(parse_timestamp);
        let has_cached_messages = self.store.message_count(&id)? > 0;

        let merge = |s: &mut Session| {
            if let Some(name) = &info.name {
                s.backend_name.clone_from(name);
            }
            if let Some(dir) = &info.working_directory {
                s.working_directory.clone_from(dir);
            }
            if let Some(ts) = last_modified {
                s.last_modified = s.last_modified.max(ts);
            }
            if !has_cached_messages {
                if let Some(count) = info.message_count {
                    s.message_count = count;
                }
                if let Some(preview) = &info.preview {
                    s.preview.clone_from(preview);
                }
            }
            s.is_locally_created = false;
        };

        if self.store.update_sessions(&|s| s.id == id, &merge)? == 0 {
            let (Some(name), Some(working_directory)) =
                (info.name.as_deref(), info.working_directory.as_deref())
            else {
                warn!(%id, "ignoring unknown session announced without name and working directory");
                return Ok(None);
            };
            let mut session = Session::new(id, name, working_directory);
            merge(&mut session);
            self.store.put_session(&session)?;
            debug!(%id, "stored session announced by backend");
        }
        self.store.get_session(&id)
    }

    /// Start a session locally, before the backend knows about it.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub fn create_local_session(
        &self,
        name: &str,
        working_directory: Option<&str>,
    ) -> Result<Session> {
        let session = Session::new_local(
            name,
            working_directory.unwrap_or(&self.default_working_directory),
        );
        self.store.put_session(&session)?;
        info!(id = %session.id, "created local session");
        Ok(session)
    }

    /// Insert a user message in the `sending` state for instant feedback.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist or the storage backend fails.
    pub fn create_optimistic_message(&self, session_id: &Uuid, text: &str) -> Result<Message> {
        let message = Message::optimistic(*session_id, text);
        let changes = MessageChanges {
            upserts: vec![message.clone()],
            ..Default::default()
        };
        self.store
            .apply_messages(session_id, &changes)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        Ok(message)
    }

    /// Send a prompt, showing it optimistically until the backend echoes it.
    ///
    /// A locally created session with nothing confirmed yet starts a new
    /// backend session; anything else resumes. If the frame cannot be handed
    /// to the connection the optimistic message is marked `error`.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist, the storage backend
    /// fails, or the connection is gone.
    pub fn send_prompt(&self, session_id: &Uuid, text: &str) -> Result<Message> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let target = if session.is_locally_created && self.last_message_id(session_id)?.is_none()
        {
            PromptTarget::New(session.id)
        } else {
            PromptTarget::Resume(session.id)
        };
        let working_directory = if session.working_directory.is_empty() {
            self.default_working_directory.as_str()
        } else {
            session.working_directory.as_str()
        };

        let message = self.create_optimistic_message(session_id, text)?;
        let frame = OutboundMessage::prompt(text, target, working_directory);
        if let Err(e) = self.connection.send(frame) {
            warn!(%session_id, error = %e, "prompt not sent");
            let failed = Message {
                status: MessageStatus::Error,
                ..message
            };
            self.store.apply_messages(
                session_id,
                &MessageChanges {
                    upserts: vec![failed],
                    ..Default::default()
                },
            )?;
            return Err(e);
        }
        Ok(message)
    }

    /// Soft-delete a session and stop following it.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist or the storage backend fails.
    pub fn mark_deleted(&self, session_id: &Uuid) -> Result<()> {
        registry::mark_deleted(self.store.as_ref(), session_id)?;
        if let Err(e) = self.unsubscribe(*session_id) {
            debug!(%session_id, error = %e, "unsubscribe after delete not sent");
        }
        Ok(())
    }

    /// Move a session to another working directory and tell the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist, the storage backend
    /// fails, or the connection is gone.
    pub fn set_working_directory(&self, session_id: &Uuid, path: &str) -> Result<()> {
        let id = *session_id;
        let updated = self
            .store
            .update_sessions(&|s| s.id == id, &|s| s.working_directory = path.to_string())?;
        if updated == 0 {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        self.connection.send(OutboundMessage::SetDirectory {
            path: path.to_string(),
        })
    }

    /// Reset a session's unread counter.
    ///
    /// # Errors
    ///
    /// Returns an error if the session does not exist or the storage backend fails.
    pub fn mark_read(&self, session_id: &Uuid) -> Result<()> {
        registry::mark_read(self.store.as_ref(), session_id)
    }

    /// Apply one forwarded message.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage backend fails.
    pub async fn handle_inbound(&self, message: InboundMessage) -> Result<()> {
        match message {
            InboundMessage::Connected { .. } => self.resubscribe_all(),
            InboundMessage::SessionHistory {
                session_id,
                messages,
            } => {
                self.handle_session_history(session_id, messages).await?;
            }
            InboundMessage::SessionCreated {
                session_id,
                name,
                working_directory,
            } => {
                self.handle_session_created(
                    &session_id,
                    name.as_deref(),
                    working_directory.as_deref(),
                )?;
            }
            InboundMessage::SessionList { sessions } => {
                self.handle_session_list(&sessions)?;
            }
            other => debug!(?other, "not a sync message"),
        }
        Ok(())
    }

    /// Consume forwarded messages until the connection task goes away.
    ///
    /// Store failures are logged and the loop keeps going.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            if let Err(e) = self.handle_inbound(message).await {
                warn!(error = %e, "failed to apply sync message");
            }
        }
        debug!("sync loop stopped");
    }
}
