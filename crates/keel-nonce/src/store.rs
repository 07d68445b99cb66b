//! Checkpoint storage seam for the nonce sequencer.
//!
//! The sequencer itself never touches I/O; it talks to a [`CheckpointStore`]
//! injected at construction. The file-backed implementation lives in
//! keel-persistence; [`MemoryCheckpointStore`] is for tests.

use crate::error::NonceResult;
use parking_lot::Mutex;

/// Durable storage for the last checkpointed nonce value.
pub trait CheckpointStore: Send + Sync {
    /// Load the last checkpointed value, or `None` on first run.
    fn load(&self) -> NonceResult<Option<u64>>;

    /// Persist the given value.
    fn store(&self, value: u64) -> NonceResult<()>;
}

/// In-memory checkpoint store for tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    value: Mutex<Option<u64>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed the store with a value, as if a previous run checkpointed it.
    pub fn with_value(value: u64) -> Self {
        Self {
            value: Mutex::new(Some(value)),
        }
    }

    /// Read the current value without going through the trait.
    pub fn current(&self) -> Option<u64> {
        *self.value.lock()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> NonceResult<Option<u64>> {
        Ok(*self.value.lock())
    }

    fn store(&self, value: u64) -> NonceResult<()> {
        *self.value.lock() = Some(value);
        Ok(())
    }
}
