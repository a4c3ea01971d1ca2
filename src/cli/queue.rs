//! `sessync queue` command implementation.

use crate::cli::{open_store, parse_session_id};
use crate::config::Config;
use crate::core::model::Session;
use crate::core::registry;
use crate::error::Result;
use crate::storage::LocalStore;
use clap::Subcommand;

/// Queue operations.
#[derive(Debug, Clone, Subcommand)]
pub enum QueueAction {
    /// Show the send queue and the priority queue.
    Show,

    /// Add a session to the back of the send queue (or move it there).
    Add {
        /// Session ID.
        session_id: String,
    },

    /// Remove a session from the send queue.
    Remove {
        /// Session ID.
        session_id: String,
    },

    /// Add a session to the priority queue, optionally in a given bucket.
    Prioritize {
        /// Session ID.
        session_id: String,

        /// Priority bucket; lower is more urgent.
        #[arg(short, long)]
        priority: Option<i32>,
    },

    /// Remove a session from the priority queue.
    Unprioritize {
        /// Session ID.
        session_id: String,
    },
}

/// Run the queue command.
///
/// # Errors
///
/// Returns an error if the storage backend fails or a session is not found.
pub fn run(config: &Config, action: Option<QueueAction>) -> Result<()> {
    let store = open_store(config)?;
    apply(&store, action.unwrap_or(QueueAction::Show))?;
    for line in render(&store)? {
        println!("{line}");
    }
    Ok(())
}

fn apply(store: &dyn LocalStore, action: QueueAction) -> Result<()> {
    match action {
        QueueAction::Show => Ok(()),
        QueueAction::Add { session_id } => registry::enqueue(store, &parse_session_id(&session_id)?),
        QueueAction::Remove { session_id } => {
            registry::dequeue(store, &parse_session_id(&session_id)?)
        }
        QueueAction::Prioritize {
            session_id,
            priority,
        } => {
            let id = parse_session_id(&session_id)?;
            registry::add_to_priority_queue(store, &id)?;
            match priority {
                Some(priority) => registry::change_priority(store, &id, priority),
                None => Ok(()),
            }
        }
        QueueAction::Unprioritize { session_id } => {
            registry::remove_from_priority_queue(store, &parse_session_id(&session_id)?)
        }
    }
}

fn render(store: &dyn LocalStore) -> Result<Vec<String>> {
    let mut lines = vec!["Send queue:".to_string()];
    let queued = registry::fetch_queued(store)?;
    if queued.is_empty() {
        lines.push("  (empty)".to_string());
    }
    lines.extend(
        queued
            .iter()
            .map(|s| format!("  {:>3}. {} {}", s.queue_position, s.id, s.display_name())),
    );

    lines.push(String::new());
    lines.push("Priority queue:".to_string());
    let prioritized = registry::fetch_priority_queue(store)?;
    if prioritized.is_empty() {
        lines.push("  (empty)".to_string());
    }
    lines.extend(prioritized.iter().map(format_priority_entry));
    Ok(lines)
}

fn format_priority_entry(session: &Session) -> String {
    format!(
        "  p{:<3} #{:<5} {} {}",
        session.priority,
        session.priority_order,
        session.id,
        session.display_name()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use uuid::Uuid;

    fn add(store: &MemoryBackend, name: &str) -> Uuid {
        let session = Session::new(Uuid::new_v4(), name, "/tmp");
        store.put_session(&session).unwrap();
        session.id
    }

    #[test]
    fn empty_queues_render_placeholders() {
        let store = MemoryBackend::new();
        let lines = render(&store).unwrap();
        assert_eq!(lines.iter().filter(|l| l.contains("(empty)")).count(), 2);
    }

    #[test]
    fn add_and_remove_through_actions() {
        let store = MemoryBackend::new();
        let a = add(&store, "alpha");
        let b = add(&store, "beta");

        apply(&store, QueueAction::Add { session_id: a.to_string() }).unwrap();
        apply(&store, QueueAction::Add { session_id: b.to_string() }).unwrap();
        apply(&store, QueueAction::Remove { session_id: a.to_string() }).unwrap();

        let lines = render(&store).unwrap();
        assert!(lines[1].contains("1.") && lines[1].contains("beta"));
    }

    #[test]
    fn prioritize_with_bucket() {
        let store = MemoryBackend::new();
        let a = add(&store, "alpha");

        apply(
            &store,
            QueueAction::Prioritize {
                session_id: a.to_string(),
                priority: Some(1),
            },
        )
        .unwrap();

        let session = store.get_session(&a).unwrap().unwrap();
        assert!(session.is_in_priority_queue);
        assert_eq!(session.priority, 1);
        assert!((session.priority_order - 1.0).abs() < f64::EPSILON);

        apply(&store, QueueAction::Unprioritize { session_id: a.to_string() }).unwrap();
        assert!(registry::fetch_priority_queue(&store).unwrap().is_empty());
    }

    #[test]
    fn unknown_session_is_an_error() {
        let store = MemoryBackend::new();
        let result = apply(
            &store,
            QueueAction::Add {
                session_id: Uuid::new_v4().to_string(),
            },
        );
        assert!(result.is_err());
    }
}
