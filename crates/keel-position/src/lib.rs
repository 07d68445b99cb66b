//! Position lifecycle tracking, exit evaluation, and capital accounting.
//!
//! The ledger owns position state, the monitor drives exits from price
//! ticks, and the capital tracker journals every realized outcome. Exits
//! always flow back through the signal pipeline rather than reaching the
//! venue directly.

pub mod capital;
pub mod error;
pub mod exit;
pub mod ledger;
pub mod monitor;

pub use capital::{CapitalConfig, CapitalTracker};
pub use error::{PositionError, PositionResult};
pub use exit::{evaluate_exit, ExitConfig, ExitReason};
pub use ledger::{CloseOutcome, ClosedPosition, Position, PositionLedger, PositionStatus};
pub use monitor::{MonitorConfig, PositionMonitor, PriceSource};
