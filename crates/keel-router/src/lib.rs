//! Order routing and execution.
//!
//! Validated order requests arrive from the pipeline, wait in a priority
//! queue, and execute against the venue through a bounded worker pool with
//! per-call timeouts and the shared retry policy. Terminal outcomes feed
//! the governor bus and the outcome channel consumed by the position
//! ledger.

pub mod error;
pub mod queue;
pub mod router;
pub mod stats;

pub use error::{RouterError, RouterResult};
pub use queue::OrderQueue;
pub use router::{
    ExecutionOutcome, ExecutionResult, OrderRouter, RouterConfig, VenueTransport,
};
pub use stats::RouterStats;
