//! In-memory key-value store: the default backend for tests and embedders
//! that manage persistence themselves. Writes can be forced to fail, or
//! held until released, to exercise persist paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{KeyValueStore, StoreError};

pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
    write_gate: Mutex<Option<Arc<Notify>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
            write_gate: Mutex::new(None),
        })
    }

    /// Seed an initial value, bypassing the failure switch.
    pub fn seed(self: &Arc<Self>, key: &str, value: &str) {
        self.entries.lock().insert(key.to_string(), value.to_string());
    }

    /// When on, every `set` fails with a backend error.
    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    /// The next `set` blocks until the returned handle is notified.
    pub fn gate_next_write(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.write_gate.lock() = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let gate = self.write_gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write disabled".into()));
        }
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
