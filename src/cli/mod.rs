//! CLI command implementations.

pub mod connect;
pub mod delete;
pub mod history;
pub mod list;
pub mod prune;
pub mod queue;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::FileBackend;
use chrono::{DateTime, Local, Utc};
use uuid::Uuid;

/// Open the durable store configured for this run.
fn open_store(config: &Config) -> Result<FileBackend> {
    FileBackend::new(config.storage.path.clone())
}

/// Parse a session identifier given on the command line.
fn parse_session_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s.trim()).map_err(|_| Error::SessionNotFound(s.to_string()))
}

/// Format UTC time as local time for display.
fn format_local_time(utc: DateTime<Utc>) -> String {
    let local: DateTime<Local> = utc.into();
    local.format("%Y-%m-%d %H:%M").to_string()
}

/// First line of `text`, cut to `max` characters.
fn truncate_line(text: &str, max: usize) -> String {
    let first_line = text.lines().next().unwrap_or(text);
    if first_line.chars().count() > max {
        let cut: String = first_line.chars().take(max).collect();
        format!("{cut}...")
    } else {
        first_line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_line_takes_first_line() {
        assert_eq!(truncate_line("first\nsecond", 50), "first");
    }

    #[test]
    fn truncate_line_cuts_long_lines() {
        let long = "x".repeat(100);
        let cut = truncate_line(&long, 40);
        assert_eq!(cut.chars().count(), 43);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn truncate_line_respects_char_boundaries() {
        assert_eq!(truncate_line("héllo wörld", 4), "héll...");
    }

    #[test]
    fn parse_session_id_rejects_garbage() {
        assert!(matches!(
            parse_session_id("nope"),
            Err(Error::SessionNotFound(_))
        ));
        let id = Uuid::new_v4();
        assert_eq!(parse_session_id(&format!(" {id} ")).unwrap(), id);
    }
}
