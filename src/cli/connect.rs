//! `sessync connect` command implementation.

use crate::cli::{open_store, parse_session_id};
use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionPhase, ConnectionSnapshot};
use crate::error::{Error, Result};
use crate::storage::LocalStore;
use crate::sync::SessionSyncManager;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Run the connect command.
///
/// Keeps the local store in sync with the backend until interrupted,
/// following the given sessions.
///
/// # Errors
///
/// Returns an error if the URL is invalid, a session id is malformed, or the
/// storage backend fails.
pub fn run(config: &Config, url: Option<&str>, sessions: &[String]) -> Result<()> {
    let mut config = config.clone();
    if let Some(url) = url {
        config.connection.url = url.to_string();
    }
    let session_ids = sessions
        .iter()
        .map(|s| parse_session_id(s))
        .collect::<Result<Vec<_>>>()?;
    let store: Arc<dyn LocalStore> = Arc::new(open_store(&config)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(sync_until_interrupted(&config, store, &session_ids))
}

async fn sync_until_interrupted(
    config: &Config,
    store: Arc<dyn LocalStore>,
    session_ids: &[Uuid],
) -> Result<()> {
    let (handle, inbound, connection_task) = ConnectionManager::spawn(&config.connection)?;
    let sync = Arc::new(SessionSyncManager::from_config(
        Arc::clone(&store),
        handle.downgrade(),
        config,
    ));
    let sync_task = tokio::spawn(Arc::clone(&sync).run(inbound));

    handle.connect(session_ids.first().copied())?;
    for id in session_ids {
        if store.get_session(id)?.is_none() {
            warn!(%id, "session not cached locally, history is ignored until the backend announces it");
        }
        sync.subscribe(*id)?;
    }
    println!(
        "Syncing with {} (Ctrl-C to stop)",
        config.connection.url
    );

    let mut states = handle.watch();
    let mut last_line = String::new();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let line = status_line(&states.borrow_and_update());
                if line != last_line {
                    println!("{line}");
                    last_line = line;
                }
            }
        }
    }

    if handle.shutdown().is_err() {
        debug!("connection task already stopped");
    }
    drop(handle);
    connection_task
        .await
        .map_err(|e| Error::InvalidState(format!("connection task failed: {e}")))?;
    sync_task
        .await
        .map_err(|e| Error::InvalidState(format!("sync task failed: {e}")))?;

    println!("Disconnected.");
    Ok(())
}

fn status_line(snapshot: &ConnectionSnapshot) -> String {
    let state = match (snapshot.phase, snapshot.authenticated) {
        (ConnectionPhase::Disconnected, _) if snapshot.requires_reauthentication => {
            "authentication required"
        }
        (ConnectionPhase::Disconnected, _) => "disconnected",
        (ConnectionPhase::Connecting, _) => "connecting",
        (ConnectionPhase::Connected, false) => "authenticating",
        (ConnectionPhase::Connected, true) => "connected",
    };
    let mut line = format!("[{state}]");
    if !snapshot.network_available {
        line.push_str(" network unavailable");
    }
    if snapshot.reconnect_attempts > 0 {
        line.push_str(&format!(" attempt {}", snapshot.reconnect_attempts));
    }
    if !snapshot.locked_sessions.is_empty() {
        line.push_str(&format!(" busy: {}", snapshot.locked_sessions.len()));
    }
    if let Some(error) = &snapshot.current_error {
        line.push_str(&format!(" error: {error}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_for_fresh_snapshot() {
        let snapshot = ConnectionSnapshot {
            network_available: true,
            ..Default::default()
        };
        assert_eq!(status_line(&snapshot), "[disconnected]");
    }

    #[test]
    fn status_line_reports_errors_and_attempts() {
        let snapshot = ConnectionSnapshot {
            phase: ConnectionPhase::Disconnected,
            network_available: true,
            reconnect_attempts: 3,
            current_error: Some("refused".to_string()),
            ..Default::default()
        };
        assert_eq!(
            status_line(&snapshot),
            "[disconnected] attempt 3 error: refused"
        );
    }

    #[test]
    fn status_line_distinguishes_auth_states() {
        let mut snapshot = ConnectionSnapshot {
            phase: ConnectionPhase::Connected,
            network_available: true,
            ..Default::default()
        };
        assert_eq!(status_line(&snapshot), "[authenticating]");

        snapshot.authenticated = true;
        assert_eq!(status_line(&snapshot), "[connected]");

        snapshot.phase = ConnectionPhase::Disconnected;
        snapshot.authenticated = false;
        snapshot.requires_reauthentication = true;
        assert_eq!(status_line(&snapshot), "[authentication required]");
    }
}
