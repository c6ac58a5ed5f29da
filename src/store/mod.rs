//! Persistent key-value storage behind an async trait.
//! Settings live under a single logical key; backends may fail and callers
//! must treat a failed write as not-persisted.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

/// Storage backend errors.
#[derive(Debug)]
pub enum StoreError {
    /// Database could not be opened or its schema prepared.
    Open(String),
    /// A read or write against the backend failed.
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Open(e) => write!(f, "store open error: {e}"),
            StoreError::Backend(e) => write!(f, "store backend error: {e}"),
        }
    }
}

/// Async key-value store. `get` returns None for absent keys; both calls
/// may fail and the error carries the backend's message.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}
