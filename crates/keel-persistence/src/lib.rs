//! Durable state for crash recovery.
//!
//! Three stores, all plain files so an operator can inspect them:
//! - nonce checkpoint (single value, atomic replace)
//! - position snapshot (JSON document, atomic replace)
//! - capital-flow journal (append-only JSON lines, daily rotation)

pub mod checkpoint;
pub mod error;
pub mod journal;
pub mod snapshot;

pub use checkpoint::FileCheckpointStore;
pub use error::{PersistenceError, PersistenceResult};
pub use journal::{CapitalFlowRecord, JournalWriter};
pub use snapshot::{PositionSnapshot, PositionSnapshotStore, SnapshotEntry};
