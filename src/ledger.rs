// =============================================================================
// Trade Ledger — durable lifecycle record of every trade
// =============================================================================
//
// The Ledger is the authoritative answer to "what do we own?".  Broker truth
// is used to validate it, but the rest of the system reads the Ledger.
//
// Trades mutate only through declared state transitions; every transition is
// journaled with a reason.  Illegal transitions are rejected, so no state is
// ever entered from a non-predecessor.
//
// Persistence: one JSON file per trading date (the trade's session_id),
// atomic tmp + rename on every mutation.
// =============================================================================

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::artifacts::ApprovedOrder;
use crate::types::Direction;

// ---------------------------------------------------------------------------
// Status machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a trade.  Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeStatus {
    /// Intent formed, nothing sent.
    Pending,
    /// Entry order accepted by the broker; no fills yet.
    Working,
    /// Entry filled; bracket children placed.
    Open,
    /// An exit is in flight.
    Closing,
    /// Exited via take-profit, time exit, or monitor close.
    Closed,
    /// Broker rejected the entry.
    Rejected,
    /// Stop-loss fired.
    StoppedOut,
    /// Entry never filled inside the wait window.
    Expired,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Rejected | Self::StoppedOut | Self::Expired
        )
    }

    /// Whether the state machine permits `self -> to`.
    pub fn can_transition_to(&self, to: TradeStatus) -> bool {
        use TradeStatus::*;
        matches!(
            (*self, to),
            (Pending, Working)
                | (Pending, Rejected)
                | (Working, Open)
                | (Working, Rejected)
                | (Working, Expired)
                | (Open, Closing)
                | (Open, StoppedOut)
                | (Closing, Closed)
                | (Closing, StoppedOut)
        )
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Working => write!(f, "WORKING"),
            Self::Open => write!(f, "OPEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::StoppedOut => write!(f, "STOPPED_OUT"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// One journaled state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeTransition {
    pub at: DateTime<Utc>,
    pub from: TradeStatus,
    pub to: TradeStatus,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Trade record
// ---------------------------------------------------------------------------

/// Durable record of one position from intent to terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub session_id: String,
    pub order: ApprovedOrder,
    #[serde(default)]
    pub entry_order_id: Option<String>,
    #[serde(default)]
    pub sl_order_id: Option<String>,
    #[serde(default)]
    pub tp_order_id: Option<String>,
    #[serde(default)]
    pub entry_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entry_fill_price: Option<f64>,
    #[serde(default)]
    pub filled_qty: u32,
    #[serde(default)]
    pub remaining_qty: u32,
    /// Set once the monitor's partial harvest has booked; the harvest fires
    /// at most once per trade.
    #[serde(default)]
    pub partial_booked: bool,
    /// Stop level as currently managed (the monitor trails it).
    pub current_stop: f64,
    #[serde(default)]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_fill_price: Option<f64>,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    pub status: TradeStatus,
    #[serde(default)]
    pub exit_reason: Option<String>,
    #[serde(default)]
    pub journal: Vec<TradeTransition>,
    /// Monitor rationale entries.
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Trade {
    /// Per-unit risk distance of the original intent (entry vs stop).
    pub fn risk_per_unit(&self) -> f64 {
        (self.order.entry_price - self.order.stop_loss).abs()
    }

    /// Unrealized P&L of the remaining quantity at `price`.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        let Some(entry) = self.entry_fill_price else {
            return 0.0;
        };
        (price - entry) * self.order.direction.sign() * self.remaining_qty as f64
    }

    /// Profit measured in units of the original per-trade risk distance.
    pub fn r_multiple(&self, price: f64) -> f64 {
        let risk = self.risk_per_unit();
        let Some(entry) = self.entry_fill_price else {
            return 0.0;
        };
        if risk == 0.0 {
            return 0.0;
        }
        (price - entry) * self.order.direction.sign() / risk
    }

    /// Worst-case rupee loss if the current stop fires on the remainder.
    pub fn worst_case_loss(&self) -> f64 {
        let Some(entry) = self.entry_fill_price else {
            return 0.0;
        };
        let per_unit = (entry - self.current_stop) * self.order.direction.sign();
        // A stop beyond breakeven locks in profit, not loss.
        (per_unit * self.remaining_qty as f64).max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// File-backed trade ledger.
pub struct TradeLedger {
    dir: PathBuf,
    trades: RwLock<BTreeMap<String, Trade>>,
}

impl TradeLedger {
    /// Open the ledger, loading every per-date file under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut trades = BTreeMap::new();

        if dir.exists() {
            for entry in std::fs::read_dir(&dir)
                .with_context(|| format!("failed to list {}", dir.display()))?
            {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let day: Vec<Trade> = serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                for trade in day {
                    trades.insert(trade.trade_id.clone(), trade);
                }
            }
        }

        info!(dir = %dir.display(), trades = trades.len(), "trade ledger opened");
        Ok(Self {
            dir,
            trades: RwLock::new(trades),
        })
    }

    /// Record a new trade intent in `Pending`.
    pub fn create(&self, order: &ApprovedOrder, session_id: &str) -> Result<Trade> {
        let trade = Trade {
            trade_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            order: order.clone(),
            entry_order_id: None,
            sl_order_id: None,
            tp_order_id: None,
            entry_time: None,
            entry_fill_price: None,
            filled_qty: 0,
            remaining_qty: 0,
            partial_booked: false,
            current_stop: order.stop_loss,
            exit_time: None,
            exit_fill_price: None,
            realized_pnl: None,
            status: TradeStatus::Pending,
            exit_reason: None,
            journal: Vec::new(),
            notes: Vec::new(),
        };

        self.trades
            .write()
            .insert(trade.trade_id.clone(), trade.clone());
        self.persist_date(session_id)?;

        debug!(trade_id = %trade.trade_id, symbol = %order.symbol, "trade created");
        Ok(trade)
    }

    /// Apply one state transition; rejects anything the graph forbids.
    pub fn transition(
        &self,
        trade_id: &str,
        to: TradeStatus,
        reason: impl Into<String>,
    ) -> Result<Trade> {
        let reason = reason.into();
        let (trade, from, session_id) = {
            let mut trades = self.trades.write();
            let trade = trades
                .get_mut(trade_id)
                .with_context(|| format!("unknown trade {trade_id}"))?;

            let from = trade.status;
            if !from.can_transition_to(to) {
                bail!("illegal trade transition {from} -> {to} for {trade_id}");
            }

            trade.status = to;
            trade.journal.push(TradeTransition {
                at: Utc::now(),
                from,
                to,
                reason: reason.clone(),
            });
            (trade.clone(), from, trade.session_id.clone())
        };
        self.persist_date(&session_id)?;

        info!(trade_id, from = %from, to = %to, reason = %reason, "trade transition");
        Ok(trade)
    }

    /// Mutate non-status fields of a trade (order ids, fills, notes) and
    /// persist.  Status changes must go through `transition`.
    pub fn update<F>(&self, trade_id: &str, mutate: F) -> Result<Trade>
    where
        F: FnOnce(&mut Trade),
    {
        let (trade, session_id) = {
            let mut trades = self.trades.write();
            let trade = trades
                .get_mut(trade_id)
                .with_context(|| format!("unknown trade {trade_id}"))?;
            let status_before = trade.status;
            mutate(trade);
            trade.status = status_before;
            (trade.clone(), trade.session_id.clone())
        };
        self.persist_date(&session_id)?;
        Ok(trade)
    }

    /// Append a monitor rationale note.
    pub fn add_note(&self, trade_id: &str, note: impl Into<String>) -> Result<()> {
        let note = note.into();
        self.update(trade_id, |t| t.notes.push(note))?;
        Ok(())
    }

    pub fn get(&self, trade_id: &str) -> Option<Trade> {
        self.trades.read().get(trade_id).cloned()
    }

    /// All trades of one session date, ordered by trade_id.
    pub fn by_date(&self, session_id: &str) -> Vec<Trade> {
        self.trades
            .read()
            .values()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn by_symbol(&self, symbol: &str) -> Vec<Trade> {
        self.trades
            .read()
            .values()
            .filter(|t| t.order.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn by_status(&self, status: TradeStatus) -> Vec<Trade> {
        self.trades
            .read()
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// Open trades of a session date, in deterministic trade_id order, so
    /// two monitor passes over the same state act identically.
    pub fn open_trades(&self, session_id: &str) -> Vec<Trade> {
        self.trades
            .read()
            .values()
            .filter(|t| t.session_id == session_id && t.status == TradeStatus::Open)
            .cloned()
            .collect()
    }

    /// Trades still holding broker exposure (entry working or position on).
    pub fn live_trades(&self, session_id: &str) -> Vec<Trade> {
        self.trades
            .read()
            .values()
            .filter(|t| {
                t.session_id == session_id
                    && matches!(
                        t.status,
                        TradeStatus::Working | TradeStatus::Open | TradeStatus::Closing
                    )
            })
            .cloned()
            .collect()
    }

    /// Realized P&L roll-up for one session date.
    pub fn realized_pnl(&self, session_id: &str) -> f64 {
        self.by_date(session_id)
            .iter()
            .filter_map(|t| t.realized_pnl)
            .sum()
    }

    fn persist_date(&self, session_id: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let day: Vec<Trade> = self.by_date(session_id);
        let path = self.dir.join(format!("{session_id}.json"));
        let content = serde_json::to_string_pretty(&day).context("failed to serialise trades")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write tmp ledger to {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename tmp ledger to {}", path.display()))?;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{Candidate, ProducedBy};
    use crate::types::EntryType;

    fn order(symbol: &str) -> ApprovedOrder {
        let tag = ProducedBy::new("intraday_analysis", "risk_sizing", "run-1");
        let candidate = Candidate::new(
            "c1",
            symbol,
            Direction::Long,
            0.8,
            0.8,
            100.0,
            100.2,
            99.0,
            101.2,
            1.0,
            Vec::new(),
            tag.clone(),
        )
        .unwrap();
        ApprovedOrder::new(&candidate, 450, EntryType::Limit, 100.0, 1, 500.0, "t", tag).unwrap()
    }

    fn ledger() -> (tempfile::TempDir, TradeLedger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::open(dir.path()).unwrap();
        (dir, ledger)
    }

    #[test]
    fn happy_path_transitions() {
        let (_dir, ledger) = ledger();
        let t = ledger.create(&order("NSE:RELIANCE-EQ"), "2026-07-30").unwrap();

        ledger.transition(&t.trade_id, TradeStatus::Working, "entry accepted").unwrap();
        ledger.transition(&t.trade_id, TradeStatus::Open, "entry filled").unwrap();
        ledger.transition(&t.trade_id, TradeStatus::Closing, "tp hit").unwrap();
        let done = ledger.transition(&t.trade_id, TradeStatus::Closed, "tp filled").unwrap();

        assert_eq!(done.status, TradeStatus::Closed);
        assert_eq!(done.journal.len(), 4);
        assert_eq!(done.journal[0].from, TradeStatus::Pending);
        assert_eq!(done.journal[3].to, TradeStatus::Closed);
    }

    #[test]
    fn illegal_transitions_rejected() {
        let (_dir, ledger) = ledger();
        let t = ledger.create(&order("NSE:INFY-EQ"), "2026-07-30").unwrap();

        // Pending cannot jump straight to Open or Closed.
        assert!(ledger.transition(&t.trade_id, TradeStatus::Open, "x").is_err());
        assert!(ledger.transition(&t.trade_id, TradeStatus::Closed, "x").is_err());

        // Terminal states accept nothing.
        ledger.transition(&t.trade_id, TradeStatus::Rejected, "broker said no").unwrap();
        assert!(ledger.transition(&t.trade_id, TradeStatus::Working, "x").is_err());
    }

    #[test]
    fn stop_out_paths() {
        let (_dir, ledger) = ledger();
        let t = ledger.create(&order("NSE:TCS-EQ"), "2026-07-30").unwrap();
        ledger.transition(&t.trade_id, TradeStatus::Working, "sent").unwrap();
        ledger.transition(&t.trade_id, TradeStatus::Open, "filled").unwrap();
        // SL child fill goes straight to StoppedOut.
        let stopped = ledger.transition(&t.trade_id, TradeStatus::StoppedOut, "sl filled").unwrap();
        assert!(stopped.status.is_terminal());
    }

    #[test]
    fn reload_preserves_trades_and_journal() {
        let dir = tempfile::tempdir().unwrap();
        let trade_id = {
            let ledger = TradeLedger::open(dir.path()).unwrap();
            let t = ledger.create(&order("NSE:SBIN-EQ"), "2026-07-30").unwrap();
            ledger.transition(&t.trade_id, TradeStatus::Working, "sent").unwrap();
            ledger
                .update(&t.trade_id, |tr| {
                    tr.entry_order_id = Some("SIM-000001".to_string());
                })
                .unwrap();
            t.trade_id
        };

        let reopened = TradeLedger::open(dir.path()).unwrap();
        let t = reopened.get(&trade_id).unwrap();
        assert_eq!(t.status, TradeStatus::Working);
        assert_eq!(t.entry_order_id.as_deref(), Some("SIM-000001"));
        assert_eq!(t.journal.len(), 1);
    }

    #[test]
    fn update_cannot_change_status() {
        let (_dir, ledger) = ledger();
        let t = ledger.create(&order("NSE:ITC-EQ"), "2026-07-30").unwrap();
        let after = ledger
            .update(&t.trade_id, |tr| tr.status = TradeStatus::Closed)
            .unwrap();
        assert_eq!(after.status, TradeStatus::Pending);
    }

    #[test]
    fn pnl_and_r_multiple_math() {
        let (_dir, ledger) = ledger();
        let t = ledger.create(&order("NSE:RELIANCE-EQ"), "2026-07-30").unwrap();
        let t = ledger
            .update(&t.trade_id, |tr| {
                tr.entry_fill_price = Some(100.0);
                tr.filled_qty = 450;
                tr.remaining_qty = 450;
            })
            .unwrap();

        // risk/unit = |100.0 - 99.0| = 1.0
        assert!((t.risk_per_unit() - 1.0).abs() < 1e-9);
        assert!((t.r_multiple(101.0) - 1.0).abs() < 1e-9);
        assert!((t.unrealized_pnl(101.0) - 450.0).abs() < 1e-9);

        // Stop at breakeven means zero worst-case loss.
        let t = ledger
            .update(&t.trade_id, |tr| tr.current_stop = 100.0)
            .unwrap();
        assert_eq!(t.worst_case_loss(), 0.0);
    }

    #[test]
    fn queries_filter_correctly() {
        let (_dir, ledger) = ledger();
        let a = ledger.create(&order("NSE:RELIANCE-EQ"), "2026-07-30").unwrap();
        let _b = ledger.create(&order("NSE:INFY-EQ"), "2026-07-29").unwrap();

        ledger.transition(&a.trade_id, TradeStatus::Working, "sent").unwrap();
        ledger.transition(&a.trade_id, TradeStatus::Open, "filled").unwrap();

        assert_eq!(ledger.by_date("2026-07-30").len(), 1);
        assert_eq!(ledger.by_status(TradeStatus::Pending).len(), 1);
        assert_eq!(ledger.open_trades("2026-07-30").len(), 1);
        assert_eq!(ledger.open_trades("2026-07-29").len(), 0);
        assert_eq!(ledger.by_symbol("NSE:INFY-EQ").len(), 1);
    }
}
