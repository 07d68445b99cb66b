//! Core domain types for the keel trading engine.
//!
//! This crate provides fundamental types used throughout the system:
//! - `Price`, `Size`: precision-safe numeric types
//! - `OrderRequest`, `OrderStatus`, `ClientOrderId`: order lifecycle types
//! - `Signal`, `SignalReason`: candidate trading decisions
//! - `MarketTick`, `AccountBalance`: dual-source market/account state
//! - `RetryPolicy`, `ErrorClass`: the shared retry/classification machinery

pub mod decimal;
pub mod error;
pub mod market;
pub mod order;
pub mod retry;
pub mod signal;

pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use market::{AccountBalance, DataSource, MarketTick};
pub use order::{
    ClientOrderId, OrderFill, OrderRequest, OrderSide, OrderStatus, OrderType,
};
pub use retry::{ErrorClass, RetryDecision, RetryPolicy};
pub use signal::{Signal, SignalIdentity, SignalPriority, SignalReason};
