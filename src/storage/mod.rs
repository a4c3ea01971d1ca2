//! Storage backends for sessions and messages.

pub mod file;
pub mod memory;
pub mod traits;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use traits::{LocalStore, MessageChanges, SessionRecord};
