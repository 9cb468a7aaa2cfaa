// =============================================================================
// Position Monitor — periodic control loop over open trades
// =============================================================================
//
// Session-wide invariant: realized + unrealized P&L never breaches
// -daily_loss_floor.  The monitor cannot open positions; it only modifies
// existing orders or closes positions, always through the execution engine.
//
// Decision table per trade (processed in trade_id order so two passes over
// the same state act identically):
//
//   1. Past flatten_time               -> full close
//   2. Thesis invalidated by the news  -> proactive close
//   3. Loser with the stop under       -> proactive close
//      ATR-expanded pressure
//   4. Winner at trail_trigger_r       -> stop to entry +/- k*ATR, never
//                                         against the trade
//   5. Winner at partial_trigger_r     -> book part once, let the rest run
//   6. Past close_tighten_time         -> stop to a fraction of ATR
//
// After the per-trade ladder a cumulative guard tightens stops
// proportionally if the sum of worst-case losses would breach the floor.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::artifacts::NewsDigest;
use crate::audit::{AuditKind, AuditLog};
use crate::broker::BrokerPort;
use crate::config::RuntimeConfig;
use crate::execution::ExecutionEngine;
use crate::indicators::atr::calculate_atr;
use crate::ledger::{Trade, TradeLedger};
use crate::types::{Candle, Direction, Resolution};

/// Fraction of ATR within which a losing trade's stop counts as "about to
/// be hit".
const STOP_PRESSURE_ATR_FRACTION: f64 = 0.25;

/// One action the monitor took, for the pass report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorAction {
    pub trade_id: String,
    pub symbol: String,
    pub action: String,
    pub detail: String,
}

/// The periodic control loop over open trades.
pub struct PositionMonitor {
    broker: Arc<dyn BrokerPort>,
    ledger: Arc<TradeLedger>,
    engine: Arc<ExecutionEngine>,
    config: Arc<RuntimeConfig>,
    audit: Arc<AuditLog>,
}

impl PositionMonitor {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        ledger: Arc<TradeLedger>,
        engine: Arc<ExecutionEngine>,
        config: Arc<RuntimeConfig>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            broker,
            ledger,
            engine,
            config,
            audit,
        }
    }

    /// Run one monitoring pass.
    ///
    /// `now_local` is the venue-local wall-clock time of the pass; `digest`
    /// is the latest committed NewsDigest from the news workflow's session.
    pub async fn run_pass(
        &self,
        session_id: &str,
        now_local: NaiveTime,
        digest: Option<&NewsDigest>,
    ) -> Result<Vec<MonitorAction>> {
        let trades = self.ledger.open_trades(session_id);
        if trades.is_empty() {
            debug!(session_id, "monitor pass: no open trades");
            return Ok(Vec::new());
        }

        let symbols: Vec<String> = trades.iter().map(|t| t.order.symbol.clone()).collect();
        let quotes: HashMap<String, f64> = self
            .broker
            .get_quote(&symbols)
            .await
            .map(|qs| qs.into_iter().map(|q| (q.symbol, q.last_price)).collect())
            .unwrap_or_default();

        let tighten_after = parse_hhmm(&self.config.monitor.close_tighten_time);
        let flatten_after = parse_hhmm(&self.config.monitor.flatten_time);

        let mut actions = Vec::new();

        for trade in &trades {
            let symbol = &trade.order.symbol;
            let Some(&price) = quotes.get(symbol) else {
                warn!(trade_id = %trade.trade_id, symbol = %symbol, "no quote — skipping trade this pass");
                continue;
            };

            let atr = self
                .rolling_atr(symbol)
                .await
                .unwrap_or_else(|| trade.risk_per_unit());

            if let Some(action) = self
                .decide_one(trade, price, atr, now_local, tighten_after, flatten_after, digest)
                .await?
            {
                actions.push(action);
            }
        }

        // Cumulative guard runs on the post-ladder state of the book.
        actions.extend(self.enforce_floor(session_id, &quotes).await?);

        info!(
            session_id,
            trades = trades.len(),
            actions = actions.len(),
            "monitor pass complete"
        );
        Ok(actions)
    }

    async fn decide_one(
        &self,
        trade: &Trade,
        price: f64,
        atr: f64,
        now_local: NaiveTime,
        tighten_after: NaiveTime,
        flatten_after: NaiveTime,
        digest: Option<&NewsDigest>,
    ) -> Result<Option<MonitorAction>> {
        let trade_id = &trade.trade_id;
        let symbol = &trade.order.symbol;
        let direction = trade.order.direction;
        let r = trade.r_multiple(price);
        let params = &self.config.monitor;

        // 1. Hard flatten past the cut-off.
        if now_local >= flatten_after {
            self.engine.close_trade(trade_id, "time_flatten").await?;
            return Ok(Some(action(trade, "close", "past flatten time")));
        }

        // 2. News invalidation.
        if let Some(d) = digest {
            if d.invalidates(symbol, direction) {
                self.engine.close_trade(trade_id, "news_invalidation").await?;
                return Ok(Some(action(trade, "close", "thesis invalidated by news")));
            }
        }

        // 3. Loser with the stop under pressure.
        let stop_gap = (price - trade.current_stop) * direction.sign();
        if r < 0.0 && stop_gap <= STOP_PRESSURE_ATR_FRACTION * atr {
            self.engine.close_trade(trade_id, "stop_pressure").await?;
            return Ok(Some(action(trade, "close", "ATR-expanded stop about to be hit")));
        }

        // 4. ATR trail, monotone in the trade's favour.
        if r >= params.trail_trigger_r {
            let k = params.trail_atr_mult.clamp(1.5, 2.0);
            let candidate = match direction {
                Direction::Long => price - k * atr,
                Direction::Short => price + k * atr,
            };
            if let Some(new_stop) = improved_stop(trade, candidate) {
                self.engine
                    .modify_stop(trade_id, new_stop, "atr_trail")
                    .await?;
                return Ok(Some(action(
                    trade,
                    "trail_stop",
                    &format!("stop to {new_stop:.2} at {r:.1}R"),
                )));
            }
        }

        // 5. One-time partial harvest, in integer lot steps.  R is per-unit
        // and does not decay with size, so without the booked flag this
        // branch would shave the position on every tick.
        if r >= params.partial_trigger_r && !trade.partial_booked && trade.remaining_qty > 1 {
            let lot = self.config.lot_size(symbol);
            let raw = (trade.remaining_qty as f64 * params.partial_fraction) as u32;
            let qty = (raw / lot) * lot;
            if qty > 0 && qty < trade.remaining_qty {
                self.engine
                    .partial_exit(trade_id, qty, &format!("{r:.1}R harvest"))
                    .await?;
                return Ok(Some(action(
                    trade,
                    "partial_exit",
                    &format!("booked {qty} at {r:.1}R"),
                )));
            }
        }

        // 6. Late-session tighten.
        if now_local >= tighten_after {
            let candidate = match direction {
                Direction::Long => price - params.tighten_atr_fraction * atr,
                Direction::Short => price + params.tighten_atr_fraction * atr,
            };
            if let Some(new_stop) = improved_stop(trade, candidate) {
                self.engine
                    .modify_stop(trade_id, new_stop, "close_tighten")
                    .await?;
                return Ok(Some(action(
                    trade,
                    "tighten_stop",
                    &format!("stop to {new_stop:.2} near the close"),
                )));
            }
        }

        Ok(None)
    }

    /// If the worst-case loss at current stops would breach the daily loss
    /// floor, tighten every losing stop proportionally until it does not.
    async fn enforce_floor(
        &self,
        session_id: &str,
        quotes: &HashMap<String, f64>,
    ) -> Result<Vec<MonitorAction>> {
        let trades = self.ledger.open_trades(session_id);
        let realized = self.ledger.realized_pnl(session_id);
        let floor = self.config.risk.daily_loss_floor;

        let total_wcl: f64 = trades.iter().map(Trade::worst_case_loss).sum();
        let projected = realized - total_wcl;
        if projected >= -floor || total_wcl == 0.0 {
            return Ok(Vec::new());
        }

        // Budget left for stop-side losses after realized P&L.
        let budget = (floor + realized.min(0.0)).max(0.0);
        let scale = budget / total_wcl;

        warn!(
            session_id,
            projected,
            floor,
            scale,
            "worst-case loss would breach the daily floor — tightening stops"
        );
        self.audit.record(
            AuditKind::FloorGuard,
            format!("stops tightened to keep worst case inside {floor:.0}"),
            json!({ "projected": projected, "scale": scale }),
        );

        let mut actions = Vec::new();
        for trade in &trades {
            let wcl = trade.worst_case_loss();
            if wcl == 0.0 {
                continue;
            }
            let Some(entry) = trade.entry_fill_price else {
                continue;
            };
            let allowed_per_unit = wcl * scale / trade.remaining_qty as f64;
            let candidate = entry - trade.order.direction.sign() * allowed_per_unit;

            if let Some(new_stop) = improved_stop(trade, candidate) {
                // Make sure we never tighten past the current price.
                let price = quotes
                    .get(&trade.order.symbol)
                    .copied()
                    .unwrap_or(entry);
                let capped = match trade.order.direction {
                    Direction::Long => new_stop.min(price),
                    Direction::Short => new_stop.max(price),
                };
                self.engine
                    .modify_stop(&trade.trade_id, capped, "floor_guard")
                    .await?;
                actions.push(action(
                    trade,
                    "floor_guard",
                    &format!("stop to {capped:.2} under the daily floor"),
                ));
            }
        }
        Ok(actions)
    }

    /// Rolling ATR from recent intraday candles.
    async fn rolling_atr(&self, symbol: &str) -> Option<f64> {
        let to = Utc::now();
        let from = to - ChronoDuration::hours(6);
        let candles: Vec<Candle> = self
            .broker
            .get_history(symbol, Resolution::M5, from, to)
            .await
            .ok()?;
        calculate_atr(&candles, 14)
    }
}

/// The stop only ever moves in the trade's favour.
fn improved_stop(trade: &Trade, candidate: f64) -> Option<f64> {
    let improved = match trade.order.direction {
        Direction::Long => candidate > trade.current_stop,
        Direction::Short => candidate < trade.current_stop,
    };
    (improved && candidate.is_finite()).then_some(candidate)
}

fn action(trade: &Trade, what: &str, detail: &str) -> MonitorAction {
    MonitorAction {
        trade_id: trade.trade_id.clone(),
        symbol: trade.order.symbol.clone(),
        action: what.to_string(),
        detail: detail.to_string(),
    }
}

/// Parse an HH:MM config string; an unparsable value falls back to a time
/// that never triggers intraday.
fn parse_hhmm(s: &str) -> NaiveTime {
    NaiveTime::parse_from_str(s, "%H:%M")
        .unwrap_or_else(|_| NaiveTime::from_hms_opt(23, 59, 0).expect("valid fallback time"))
}
