pub mod manager;
pub mod state_store;

pub use manager::{Snapshot, StateManager};
pub use state_store::{sanitize_key, FileStateStore, MemoryStateStore, StateStore, StoredEntry};
