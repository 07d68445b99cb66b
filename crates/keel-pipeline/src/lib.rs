//! Signal intake pipeline: deduplication, batching, risk gating.
//!
//! Signals from detectors, the position ledger's exit monitor, and the
//! governor's liquidation path all enter through [`SignalPipeline::submit`]
//! and leave as validated [`keel_core::OrderRequest`]s on the router
//! channel.

pub mod batch;
pub mod dedup;
pub mod error;
pub mod gate;
pub mod pipeline;

pub use batch::{BatchConfig, SignalBatcher};
pub use dedup::{DedupOutcome, SignalDeduper};
pub use error::{PipelineError, PipelineResult};
pub use gate::{CapitalProvider, CapitalSnapshot, GateConfig, GateReject, RiskGate};
pub use pipeline::{PipelineStats, SignalPipeline, SubmitOutcome};
