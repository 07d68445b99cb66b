//! Order lifecycle types.
//!
//! An `OrderRequest` is produced by the signal pipeline and owned
//! exclusively by the order router until it reaches a terminal status,
//! after which the fill (if any) is handed to the position ledger.

use crate::{Price, Size};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Returns 1 for buy, -1 for sell (for position calculations).
    pub fn sign(&self) -> i8 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Market order (primary type for the taker pipeline).
    Market,
    /// Limit order.
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

/// Order status lifecycle.
///
/// Transitions are monotonic: Pending → Submitted → {Filled, Failed,
/// Cancelled}. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Created, not yet sent to the venue.
    Pending,
    /// Accepted by the venue, awaiting fill.
    Submitted,
    /// Completely filled.
    Filled,
    /// Rejected or failed after retries.
    Failed,
    /// Cancelled before submission (e.g., circuit opened).
    Cancelled,
}

impl OrderStatus {
    /// True for terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Failed | Self::Cancelled)
    }

    /// Check whether a transition to `next` is allowed.
    ///
    /// Terminal states accept no further transitions; Pending may move to
    /// any state, Submitted only to a terminal one.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Submitted => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Client order ID for idempotency.
///
/// Every order carries a unique id so retries never submit twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Create a new unique client order ID.
    ///
    /// Format: `keel_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().to_string()[..8];
        Self(format!("keel_{ts}_{uuid_short}"))
    }

    /// Create from an existing string (for parsing responses).
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientOrderId {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl AsRef<str> for ClientOrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated order request handed to the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client order ID for idempotency.
    pub id: ClientOrderId,
    /// Venue symbol (e.g., "BTC/USD").
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Requested size.
    pub size: Size,
    /// Order type.
    pub order_type: OrderType,
    /// Priority inherited from the originating signal. Higher runs first.
    pub priority: u8,
    /// Whether this order closes an existing position (exit path).
    pub reduce_only: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl OrderRequest {
    /// Create a new market order request.
    pub fn market(symbol: impl Into<String>, side: OrderSide, size: Size, priority: u8) -> Self {
        Self {
            id: ClientOrderId::new(),
            symbol: symbol.into(),
            side,
            size,
            order_type: OrderType::Market,
            priority,
            reduce_only: false,
            created_at: Utc::now(),
        }
    }

    /// Mark this request as reduce-only (exit order).
    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    /// Age of this request in milliseconds.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.created_at).num_milliseconds()
    }
}

/// A confirmed execution from the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    /// Client order ID of the filled request.
    pub order_id: ClientOrderId,
    /// Symbol.
    pub symbol: String,
    /// Side.
    pub side: OrderSide,
    /// Executed size.
    pub size: Size,
    /// Average execution price.
    pub price: Price,
    /// Fee paid, in quote currency.
    pub fee: Price,
    /// Execution timestamp.
    pub filled_at: DateTime<Utc>,
}
