//! Nonce sequencing for signed venue requests.
//!
//! The venue rejects any signed request whose nonce is not strictly greater
//! than the last one it saw for the credential. Every signed call in the
//! system must therefore route through [`NonceSequencer::acquire`]; reading
//! wall-clock time at a call site reintroduces collisions under concurrency.

pub mod error;
pub mod sequencer;
pub mod store;

pub use error::{NonceError, NonceResult};
pub use sequencer::{Clock, NonceSequencer, NonceTicket, SystemClock};
pub use store::{CheckpointStore, MemoryCheckpointStore};
