//! Wire model for the venue's streaming protocol.
//!
//! Outbound control messages (subscribe/unsubscribe/ping) and inbound
//! frames (acks, channel data, heartbeats, errors), plus conversion into
//! typed [`StreamEvent`]s consumed by state sync.

use chrono::{DateTime, Utc};
use keel_core::{AccountBalance, DataSource, MarketTick, OrderSide, Price, Size};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{WsError, WsResult};

/// Subscription channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Best bid/ask/last per symbol (public).
    Ticker,
    /// Order book deltas (public).
    Book,
    /// Candles (public).
    Ohlc,
    /// Public trades (public).
    Trade,
    /// Account balances (private).
    Balances,
    /// Order executions (private).
    Executions,
    /// Venue liveness channel.
    Heartbeat,
}

impl Channel {
    /// Private channels require a session token.
    pub fn is_private(&self) -> bool {
        matches!(self, Self::Balances | Self::Executions)
    }

    /// Wire name of this channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Book => "book",
            Self::Ohlc => "ohlc",
            Self::Trade => "trade",
            Self::Balances => "balances",
            Self::Executions => "executions",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Parse a wire channel name.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "ticker" => Some(Self::Ticker),
            "book" => Some(Self::Book),
            "ohlc" => Some(Self::Ohlc),
            "trade" => Some(Self::Trade),
            "balances" => Some(Self::Balances),
            "executions" => Some(Self::Executions),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outbound request frame.
#[derive(Debug, Clone, Serialize)]
pub struct WsRequest {
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<RequestParams>,
}

/// Parameters for subscribe/unsubscribe requests.
#[derive(Debug, Clone, Serialize)]
pub struct RequestParams {
    pub channel: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub symbols: Vec<String>,
    /// Session token, required for private channels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl WsRequest {
    /// Subscribe to a public channel for the given symbols.
    pub fn subscribe(channel: Channel, symbols: Vec<String>) -> Self {
        Self {
            method: "subscribe",
            params: Some(RequestParams {
                channel: channel.as_str().to_string(),
                symbols,
                token: None,
            }),
        }
    }

    /// Subscribe to a private channel with a session token.
    pub fn subscribe_private(channel: Channel, token: String) -> Self {
        Self {
            method: "subscribe",
            params: Some(RequestParams {
                channel: channel.as_str().to_string(),
                symbols: Vec::new(),
                token: Some(token),
            }),
        }
    }

    /// Unsubscribe from a channel.
    pub fn unsubscribe(channel: Channel, symbols: Vec<String>) -> Self {
        Self {
            method: "unsubscribe",
            params: Some(RequestParams {
                channel: channel.as_str().to_string(),
                symbols,
                token: None,
            }),
        }
    }

    /// Application-level ping.
    pub fn ping() -> Self {
        Self {
            method: "ping",
            params: None,
        }
    }
}

/// Inbound frame, as parsed from the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WsMessage {
    /// Reply to a method call (subscribe ack, pong, error reply).
    MethodReply(MethodReply),
    /// Channel data frame.
    ChannelData(ChannelData),
}

/// Reply to an outbound method call.
#[derive(Debug, Clone, Deserialize)]
pub struct MethodReply {
    pub method: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A data frame on a subscribed channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelData {
    pub channel: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Ticker payload on the wire. Prices arrive as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct WireTicker {
    pub symbol: String,
    pub bid: String,
    pub ask: String,
    pub last: String,
}

/// Balance payload on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct WireBalance {
    pub asset: String,
    pub free: String,
    pub locked: String,
}

/// Execution payload on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct WireExecution {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub status: String,
    pub filled_size: String,
    pub avg_price: String,
    #[serde(default)]
    pub fee: Option<String>,
}

/// A parsed order execution update from the private stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUpdate {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    /// Wire status string ("filled", "canceled", "rejected", ...).
    pub status: String,
    pub filled_size: Size,
    pub avg_price: Price,
    pub fee: Price,
    pub received_at: DateTime<Utc>,
}

/// Typed events forwarded to state sync.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Tick(MarketTick),
    Balance(AccountBalance),
    Execution(ExecutionUpdate),
    Heartbeat,
    /// Subscription ack (or rejection) for a channel.
    SubscriptionAck {
        channel: String,
        success: bool,
        error: Option<String>,
    },
}

fn parse_price(s: &str, field: &str) -> WsResult<Price> {
    Price::from_str(s).map_err(|e| WsError::ParseError(format!("{field} '{s}': {e}")))
}

fn parse_size(s: &str, field: &str) -> WsResult<Size> {
    Size::from_str(s).map_err(|e| WsError::ParseError(format!("{field} '{s}': {e}")))
}

fn parse_side(s: &str) -> WsResult<OrderSide> {
    match s {
        "buy" => Ok(OrderSide::Buy),
        "sell" => Ok(OrderSide::Sell),
        other => Err(WsError::ParseError(format!("unknown side '{other}'"))),
    }
}

impl ChannelData {
    /// Convert a channel data frame into stream events.
    ///
    /// Ticker frames carry one object; balances and executions carry
    /// arrays. Unknown channels yield no events (forward compatibility).
    pub fn into_events(self) -> WsResult<Vec<StreamEvent>> {
        let Some(channel) = Channel::from_wire(&self.channel) else {
            tracing::debug!(channel = %self.channel, "ignoring unknown channel");
            return Ok(Vec::new());
        };

        match channel {
            Channel::Heartbeat => Ok(vec![StreamEvent::Heartbeat]),
            Channel::Ticker => {
                let wire: WireTicker = serde_json::from_value(self.data)?;
                let tick = MarketTick::new(
                    wire.symbol.clone(),
                    parse_price(&wire.bid, "bid")?,
                    parse_price(&wire.ask, "ask")?,
                    parse_price(&wire.last, "last")?,
                    DataSource::Stream,
                );
                Ok(vec![StreamEvent::Tick(tick)])
            }
            Channel::Balances => {
                let wires: Vec<WireBalance> = serde_json::from_value(self.data)?;
                wires
                    .into_iter()
                    .map(|w| {
                        Ok(StreamEvent::Balance(AccountBalance::new(
                            w.asset.clone(),
                            parse_size(&w.free, "free")?,
                            parse_size(&w.locked, "locked")?,
                            DataSource::Stream,
                        )))
                    })
                    .collect()
            }
            Channel::Executions => {
                let wires: Vec<WireExecution> = serde_json::from_value(self.data)?;
                wires
                    .into_iter()
                    .map(|w| {
                        let fee = match &w.fee {
                            Some(f) => parse_price(f, "fee")?,
                            None => Price::ZERO,
                        };
                        Ok(StreamEvent::Execution(ExecutionUpdate {
                            order_id: w.order_id,
                            symbol: w.symbol,
                            side: parse_side(&w.side)?,
                            status: w.status,
                            filled_size: parse_size(&w.filled_size, "filled_size")?,
                            avg_price: parse_price(&w.avg_price, "avg_price")?,
                            fee,
                            received_at: Utc::now(),
                        }))
                    })
                    .collect()
            }
            // Book/Ohlc/Trade feed collaborators outside the core; the
            // connection still acks and drops them here.
            Channel::Book | Channel::Ohlc | Channel::Trade => Ok(Vec::new()),
        }
    }
}
