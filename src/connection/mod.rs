//! Websocket connection lifecycle.

pub mod debounce;
pub mod manager;
pub mod network;
pub mod state;

pub use manager::{
    AppLifecycle, ConnectionCommand, ConnectionHandle, ConnectionManager, WeakConnectionHandle,
};
pub use network::{InterfaceType, NetworkPath, NetworkStatus, PathStatus};
pub use state::{ConnectionMachine, ConnectionPhase, ConnectionSnapshot};
