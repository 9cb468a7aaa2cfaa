// =============================================================================
// Broker Port — typed façade over the brokerage
// =============================================================================
//
// The capability set the core depends on.  Implementations are pluggable
// (live HTTP adapter, simulated broker); no broker-specific type ever leaks
// past this boundary — symbology, order codes, and status strings are
// translated here into the core's enumerations.
//
// Error contract: every operation returns `Result<_, BrokerError>`.  Rate
// limits are enforced *inside* the port; a breach fails fast with
// `RateLimit { retry_after }` and is never queued silently.
// =============================================================================

pub mod http;
pub mod rate_limit;
pub mod sim;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{Candle, EntryType, ProductType, Resolution, Side};

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Tagged failure returned by every broker operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    /// The port's own rate limiter (or the broker's 429) rejected the call.
    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimit { retry_after_ms: u64 },

    /// The access token was rejected; the token ladder must run.
    #[error("authentication expired")]
    AuthExpired,

    /// Network or broker-side failure outside our control.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// The symbol is unknown to the broker.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    /// The broker rejected the specific order with a coded message.
    #[error("order rejected ({code}): {message}")]
    Rejected { code: i64, message: String },
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Minimal account identity, used as the liveness probe for the token ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub name: String,
}

/// Latest market snapshot for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub last_price: f64,
    pub change_pct: f64,
    pub volume: f64,
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    /// Bid-ask spread in basis points of the mid price.
    pub fn spread_bps(&self) -> Option<f64> {
        let mid = (self.bid + self.ask) / 2.0;
        if mid <= 0.0 {
            return None;
        }
        Some((self.ask - self.bid) / mid * 10_000.0)
    }
}

/// One price level of the order book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: u64,
    pub orders: u32,
}

/// Five-level book plus session OHLC and circuit limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Depth {
    pub symbol: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub upper_circuit: f64,
    pub lower_circuit: f64,
}

/// One strike of an option chain, centred around ATM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionStrike {
    pub strike: f64,
    pub call_oi: f64,
    pub put_oi: f64,
    pub call_iv: f64,
    pub put_iv: f64,
    pub call_delta: f64,
    pub put_delta: f64,
}

/// Option chain snapshot for one underlying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionChain {
    pub symbol: String,
    pub spot: f64,
    pub strikes: Vec<OptionStrike>,
}

/// Available and utilized funds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundsSnapshot {
    pub available: f64,
    pub utilized: f64,
}

/// Margin check result for a batch of intents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginRequirement {
    pub required: f64,
    pub available: f64,
}

impl MarginRequirement {
    pub fn sufficient(&self) -> bool {
        self.required <= self.available
    }
}

/// Broker-side order status, already translated from the adapter's codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderStatus {
    Accepted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl std::fmt::Display for BrokerOrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted => write!(f, "ACCEPTED"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// An order as the broker currently sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order_id: String,
    pub client_tag: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: EntryType,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub quantity: u32,
    pub filled_qty: u32,
    pub avg_fill_price: f64,
    pub status: BrokerOrderStatus,
    pub parent_id: Option<String>,
    pub message: Option<String>,
}

/// Net position as the broker currently sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub net_qty: i64,
    pub avg_price: f64,
    pub realized_pnl: f64,
}

/// One execution from the trade book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradebookEntry {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u32,
    pub price: f64,
    pub traded_at: DateTime<Utc>,
}

/// A delivery holding (not traded intraday, surfaced for completeness).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub quantity: u32,
    pub avg_cost: f64,
}

/// Push update from the broker order feed.  Delivery is at-least-once;
/// consumers must be idempotent on (order_id, status, filled_qty).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub client_tag: String,
    pub symbol: String,
    pub status: BrokerOrderStatus,
    pub filled_qty: u32,
    pub avg_fill_price: f64,
    pub at: DateTime<Utc>,
}

/// Push tick from the market feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub last_price: f64,
    pub at: DateTime<Utc>,
}

/// What the caller wants done.  `client_tag` is the idempotency key: a
/// retry with an identical tag within the port's window is either a no-op
/// or returns the original order id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub client_tag: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: EntryType,
    pub quantity: u32,
    pub limit_price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub product_type: ProductType,
    pub parent_id: Option<String>,
}

/// Requested changes to a live order; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderChanges {
    pub quantity: Option<u32>,
    pub limit_price: Option<f64>,
    pub trigger_price: Option<f64>,
}

// ---------------------------------------------------------------------------
// The port trait
// ---------------------------------------------------------------------------

/// Capability set of the brokerage.  All symbology is exchange-qualified
/// (`NSE:RELIANCE-EQ`) and opaque to the core.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    async fn get_profile(&self) -> Result<Profile, BrokerError>;

    async fn get_quote(&self, symbols: &[String]) -> Result<Vec<Quote>, BrokerError>;

    async fn get_depth(&self, symbol: &str) -> Result<Depth, BrokerError>;

    /// Ordered candle sequence for the window; restartable via (from, to).
    async fn get_history(
        &self,
        symbol: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, BrokerError>;

    async fn get_option_chain(
        &self,
        symbol: &str,
        strike_count: u32,
    ) -> Result<OptionChain, BrokerError>;

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    async fn get_holdings(&self) -> Result<Vec<Holding>, BrokerError>;

    async fn get_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError>;

    async fn get_tradebook(&self) -> Result<Vec<TradebookEntry>, BrokerError>;

    async fn get_funds(&self) -> Result<FundsSnapshot, BrokerError>;

    /// Place an order; returns the broker order id.  Idempotent per
    /// `client_tag` within a short window.
    async fn place_order(&self, intent: &OrderIntent) -> Result<String, BrokerError>;

    async fn modify_order(&self, order_id: &str, changes: &OrderChanges)
        -> Result<(), BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    /// Place a stop-loss or take-profit child attached to a filled parent.
    async fn place_bracket_child(
        &self,
        parent_id: &str,
        side: Side,
        order_type: EntryType,
        price: f64,
        quantity: u32,
        client_tag: &str,
    ) -> Result<String, BrokerError>;

    async fn calc_margin(&self, intents: &[OrderIntent]) -> Result<MarginRequirement, BrokerError>;

    /// Subscribe to the at-least-once order update feed.
    fn subscribe_orders(&self) -> mpsc::UnboundedReceiver<OrderUpdate>;

    /// Subscribe to last-price ticks for `symbols`.
    fn subscribe_market(&self, symbols: &[String]) -> mpsc::UnboundedReceiver<Tick>;
}
