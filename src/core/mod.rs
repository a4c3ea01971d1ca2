//! Core types and synchronization logic.

pub mod model;
pub mod pruning;
pub mod reconcile;
pub mod registry;

pub use model::{DEFAULT_PRIORITY, Message, MessageRole, MessageStatus, Session};
pub use reconcile::{ReconcileOutcome, reconcile};
