//! File-based storage backend.

use crate::core::model::{Message, Session};
use crate::error::Result;
use crate::storage::traits::{LocalStore, MessageChanges, SessionRecord};
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::warn;
use uuid::Uuid;

/// File-based storage backend with atomic writes.
///
/// Each session and the messages it owns live in one `sessions/<id>.json`
/// file, so a record is always replaced as a whole.
#[derive(Debug)]
pub struct FileBackend {
    base_dir: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileBackend {
    /// Create a new file backend.
    ///
    /// Creates the sessions directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the sessions directory cannot be created.
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(base_dir.join("sessions"))?;
        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the path to a session file.
    fn record_path(&self, id: &Uuid) -> PathBuf {
        self.base_dir.join("sessions").join(format!("{id}.json"))
    }

    fn read_record(&self, id: &Uuid) -> Result<Option<SessionRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let record: SessionRecord = serde_json::from_str(&contents)?;
        Ok(Some(record))
    }

    fn write_record(&self, record: &SessionRecord) -> Result<()> {
        let path = self.record_path(&record.session.id);
        let temp = path.with_extension("tmp");

        let contents = serde_json::to_string_pretty(record)?;
        fs::write(&temp, &contents)?;

        // Atomic rename - readers see either the old or the new record
        fs::rename(&temp, &path)?;

        Ok(())
    }

    /// Read every well-formed record, skipping stray or corrupted files.
    fn read_all(&self) -> Result<Vec<SessionRecord>> {
        let sessions_dir = self.base_dir.join("sessions");
        let mut records = Vec::new();

        if !sessions_dir.exists() {
            return Ok(records);
        }

        for entry in fs::read_dir(&sessions_dir)? {
            let path = entry?.path();

            // Only process .json files (skip .tmp files)
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }

            match fs::read_to_string(&path)
                .map_err(crate::error::Error::from)
                .and_then(|c| serde_json::from_str::<SessionRecord>(&c).map_err(Into::into))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session file"),
            }
        }

        Ok(records)
    }
}

impl LocalStore for FileBackend {
    fn get_session(&self, id: &Uuid) -> Result<Option<Session>> {
        Ok(self.read_record(id)?.map(|r| r.session))
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.read_all()?.into_iter().map(|r| r.session).collect())
    }

    fn put_session(&self, session: &Session) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let record = match self.read_record(&session.id)? {
            Some(mut existing) => {
                existing.session = session.clone();
                existing
            }
            None => SessionRecord::new(session.clone()),
        };
        self.write_record(&record)
    }

    fn update_sessions(
        &self,
        predicate: &dyn Fn(&Session) -> bool,
        apply: &dyn Fn(&mut Session),
    ) -> Result<usize> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut updated = 0;
        for mut record in self.read_all()? {
            if predicate(&record.session) {
                apply(&mut record.session);
                self.write_record(&record)?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn delete_session(&self, id: &Uuid) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.record_path(id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn get_messages(&self, session_id: &Uuid) -> Result<Vec<Message>> {
        Ok(self
            .read_record(session_id)?
            .map(|r| r.messages)
            .unwrap_or_default())
    }

    fn apply_messages(
        &self,
        session_id: &Uuid,
        changes: &MessageChanges,
    ) -> Result<Option<Session>> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut record) = self.read_record(session_id)? else {
            return Ok(None);
        };
        record.apply(changes);
        self.write_record(&record)?;
        Ok(Some(record.session))
    }
}
