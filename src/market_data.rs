// =============================================================================
// Market-Data Port — auxiliary data behind one shape regardless of source
// =============================================================================
//
// Four capability groups: institutional flows, news stream, fundamentals,
// event calendar.  Records are pre-shaped for direct inclusion in analyst
// inputs; the core never sees a raw upstream payload.
//
// Failure contract: auxiliary data is never load-bearing.  Adapters log a
// warning and return empty collections on upstream failure; a workflow must
// not halt because flows or news were unavailable.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::artifacts::Sentiment;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Institutional flow segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowSegment {
    ForeignInstitutional,
    DomesticInstitutional,
}

/// One day's gross/net flows for one segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub date: NaiveDate,
    pub segment: FlowSegment,
    pub gross_buy: f64,
    pub gross_sell: f64,
}

impl FlowSnapshot {
    pub fn net(&self) -> f64 {
        self.gross_buy - self.gross_sell
    }
}

/// A single news item from the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub headline: String,
    pub source: String,
    pub symbols: Vec<String>,
    pub sentiment_hint: Option<Sentiment>,
    pub published_at: DateTime<Utc>,
}

/// Snapshot fundamentals for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fundamentals {
    pub symbol: String,
    pub market_cap: f64,
    pub pe_ratio: Option<f64>,
    pub eps: Option<f64>,
    pub sector: String,
}

/// Scheduled market event (earnings, policy decision, expiry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub date: NaiveDate,
    pub title: String,
    pub symbols: Vec<String>,
}

// ---------------------------------------------------------------------------
// The port trait
// ---------------------------------------------------------------------------

/// Read-only access to auxiliary market data.  Empty results are valid.
#[async_trait]
pub trait MarketDataPort: Send + Sync {
    async fn institutional_flows(&self, date: NaiveDate) -> Vec<FlowSnapshot>;

    /// News items published at or after `cutoff`.
    async fn news_since(&self, cutoff: DateTime<Utc>) -> Vec<NewsItem>;

    async fn fundamentals(&self, symbol: &str) -> Option<Fundamentals>;

    async fn event_calendar(&self, from: NaiveDate, to: NaiveDate) -> Vec<CalendarEvent>;
}

// ---------------------------------------------------------------------------
// Static in-memory source (tests, offline runs)
// ---------------------------------------------------------------------------

/// In-memory market-data source scripted by tests and used for offline runs.
#[derive(Default)]
pub struct StaticMarketData {
    flows: RwLock<Vec<FlowSnapshot>>,
    news: RwLock<Vec<NewsItem>>,
    fundamentals: RwLock<Vec<Fundamentals>>,
    events: RwLock<Vec<CalendarEvent>>,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_flow(&self, flow: FlowSnapshot) {
        self.flows.write().push(flow);
    }

    pub fn push_news(&self, item: NewsItem) {
        self.news.write().push(item);
    }

    pub fn push_fundamentals(&self, f: Fundamentals) {
        self.fundamentals.write().push(f);
    }

    pub fn push_event(&self, event: CalendarEvent) {
        self.events.write().push(event);
    }
}

#[async_trait]
impl MarketDataPort for StaticMarketData {
    async fn institutional_flows(&self, date: NaiveDate) -> Vec<FlowSnapshot> {
        self.flows
            .read()
            .iter()
            .filter(|f| f.date == date)
            .cloned()
            .collect()
    }

    async fn news_since(&self, cutoff: DateTime<Utc>) -> Vec<NewsItem> {
        self.news
            .read()
            .iter()
            .filter(|n| n.published_at >= cutoff)
            .cloned()
            .collect()
    }

    async fn fundamentals(&self, symbol: &str) -> Option<Fundamentals> {
        self.fundamentals
            .read()
            .iter()
            .find(|f| f.symbol == symbol)
            .cloned()
    }

    async fn event_calendar(&self, from: NaiveDate, to: NaiveDate) -> Vec<CalendarEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.date >= from && e.date <= to)
            .cloned()
            .collect()
    }
}
