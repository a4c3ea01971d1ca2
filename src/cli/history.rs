//! `sessync history` command implementation.

use crate::cli::{format_local_time, open_store, parse_session_id, truncate_line};
use crate::config::Config;
use crate::core::model::{Message, MessageRole, MessageStatus};
use crate::error::{Error, Result};
use crate::storage::LocalStore;

/// Maximum length of a message line.
const TEXT_LEN: usize = 80;

/// Run the history command.
///
/// Shows a session's cached messages in chronological order.
///
/// # Errors
///
/// Returns an error if the storage backend fails or the session is not found.
pub fn run(config: &Config, session_id: &str, limit: Option<usize>, full: bool) -> Result<()> {
    let store = open_store(config)?;
    let id = parse_session_id(session_id)?;
    let session = store
        .get_session(&id)?
        .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

    let messages = tail(&store, &id, limit)?;

    println!("{} ({})", session.display_name(), session.working_directory);
    println!("{}", "─".repeat(100));
    if messages.is_empty() {
        println!("No cached messages.");
    }
    for message in &messages {
        println!("{}", format_message(message, full));
    }
    println!("{}", "─".repeat(100));
    println!(
        "Showing {} of {} message(s)",
        messages.len(),
        session.message_count
    );

    Ok(())
}

/// The newest `limit` messages, still in chronological order.
fn tail(store: &dyn LocalStore, id: &uuid::Uuid, limit: Option<usize>) -> Result<Vec<Message>> {
    let mut messages = store.get_messages(id)?;
    if let Some(limit) = limit {
        let skip = messages.len().saturating_sub(limit);
        messages.drain(..skip);
    }
    Ok(messages)
}

fn format_message(message: &Message, full: bool) -> String {
    let role = match message.role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    };
    let status = match message.status {
        MessageStatus::Confirmed => "",
        MessageStatus::Sending => " (sending)",
        MessageStatus::Error => " (failed)",
    };
    let text = if full {
        message.text.clone()
    } else {
        truncate_line(&message.text, TEXT_LEN)
    };
    format!(
        "{} {role:>9}{status}: {text}",
        format_local_time(message.timestamp)
    )
}
