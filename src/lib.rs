//! sessync - client-side session synchronization core.
//!
//! Keeps a deduplicated, chronologically ordered message history for many
//! sessions in a local store, live over a websocket to the backend, and
//! resilient to reconnects, replays and stale caches.

pub mod cli;
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod protocol;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};
pub use sync::SessionSyncManager;
