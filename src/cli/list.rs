//! `sessync list` command implementation.

use crate::cli::{format_local_time, open_store, truncate_line};
use crate::config::Config;
use crate::core::model::Session;
use crate::core::registry;
use crate::error::Result;
use crate::storage::LocalStore;

/// Default number of sessions to show.
const DEFAULT_LIMIT: usize = 20;

/// Maximum length for the preview column.
const PREVIEW_LEN: usize = 40;

/// Run the list command.
///
/// Shows active sessions, most recently modified first.
///
/// # Errors
///
/// Returns an error if the storage backend fails.
pub fn run(config: &Config, limit: Option<usize>, all: bool) -> Result<()> {
    let store = open_store(config)?;
    let sessions = select_sessions(&store, limit.unwrap_or(DEFAULT_LIMIT), all)?;

    if sessions.is_empty() {
        println!("No sessions found.");
        println!("\nSessions are stored in: {}", config.storage.path.display());
        return Ok(());
    }

    println!(
        "{:<38} {:<17} {:>5} {:>6}  Name / Preview",
        "Session ID", "Modified", "Msgs", "Unread"
    );
    println!("{}", "─".repeat(100));

    for session in &sessions {
        println!("{}", format_row(session));
    }

    println!("{}", "─".repeat(100));
    println!("Showing {} session(s)", sessions.len());

    Ok(())
}

/// Sessions to show, newest first.
fn select_sessions(store: &dyn LocalStore, limit: usize, all: bool) -> Result<Vec<Session>> {
    let mut sessions = if all {
        let mut sessions = store.list_sessions()?;
        sessions.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        sessions
    } else {
        registry::fetch_active(store)?
    };
    sessions.truncate(limit);
    Ok(sessions)
}

fn format_row(session: &Session) -> String {
    let mut name = session.display_name().to_string();
    if session.marked_deleted {
        name.push_str(" [deleted]");
    } else if session.is_locally_created {
        name.push_str(" [local]");
    }
    let preview = if session.preview.is_empty() {
        String::new()
    } else {
        format!(" - {}", truncate_line(&session.preview, PREVIEW_LEN))
    };
    format!(
        "{:<38} {:<17} {:>5} {:>6}  {name}{preview}",
        session.id,
        format_local_time(session.last_modified),
        session.message_count,
        session.unread_count,
    )
}
