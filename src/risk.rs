// =============================================================================
// Risk Engine — sizing and capital gates between Candidates and ApprovedOrders
// =============================================================================
//
// Domain policy, not error handling: a candidate that fails a gate produces
// a rejection record, the batch continues, and an empty approved set is a
// perfectly normal outcome that downstream stages must tolerate.
//
// Gates, in order:
//   1. Regime multiplier   — scales the rupee risk budget per trade; a HALT
//                            regime (multiplier 0) sizes everything to zero.
//   2. Per-trade risk cap  — quantity x stop distance <= per_trade_risk.
//   3. Lot rounding        — quantity is floored to a lot multiple; zero
//                            quantity rejects the candidate.
//   4. Book limits         — max open trades, per-sector exposure cap.
//   5. Daily loss floor    — cumulative risk of approved + already-open
//                            trades must stay inside the floor.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifacts::{ApprovedOrder, Candidate, ProducedBy, Regime};
use crate::broker::Quote;
use crate::config::{ExecutionParams, RiskParams, RuntimeConfig};
use crate::types::{Direction, EntryType};

/// A candidate the risk engine declined, with the gate that stopped it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRejection {
    pub symbol: String,
    pub candidate_id: String,
    pub reason: String,
}

/// Outcome of one sizing pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDecision {
    pub approved: Vec<ApprovedOrder>,
    pub rejections: Vec<RiskRejection>,
}

/// Exposure already on the book when the sizing pass runs.
#[derive(Debug, Clone, Default)]
pub struct BookExposure {
    /// Worst-case rupee loss of pending + open trades at current stops.
    pub open_risk: f64,
    /// Live trade count.
    pub open_trades: u32,
    /// Live trade count per sector label.
    pub sector_counts: HashMap<String, u32>,
}

/// Sizing and capital gate engine.
pub struct RiskEngine {
    params: RiskParams,
    execution: ExecutionParams,
}

impl RiskEngine {
    pub fn new(params: RiskParams, execution: ExecutionParams) -> Self {
        Self { params, execution }
    }

    /// Quantity for one candidate: rupee risk budget divided by stop
    /// distance, scaled by the regime multiplier (capped at 1 so the
    /// per-trade invariant can never be sized past), floored to a lot
    /// multiple.
    pub fn size_quantity(&self, stop_distance: f64, multiplier: f64, lot_size: u32) -> u32 {
        if stop_distance <= 0.0 || !stop_distance.is_finite() {
            return 0;
        }
        let budget = self.params.per_trade_risk * multiplier.clamp(0.0, 1.0);
        let raw = (budget / stop_distance).floor() as u32;
        let lot = lot_size.max(1);
        (raw / lot) * lot
    }

    /// Entry price for sizing: the edge of the range nearest the stop, so
    /// the sized risk is an upper bound on the fill's risk.
    fn entry_price(candidate: &Candidate) -> f64 {
        match candidate.direction {
            Direction::Long => candidate.entry_low,
            Direction::Short => candidate.entry_high,
        }
    }

    /// Entry type from candidate quality: deep volume, a tight book, and a
    /// strong composite go MARKET; everything else is a LIMIT at the range
    /// edge.
    fn entry_type(&self, candidate: &Candidate, quote: Option<&Quote>) -> EntryType {
        let liquid = quote
            .map(|q| q.volume >= self.execution.high_liquidity_volume)
            .unwrap_or(false);
        let tight = quote
            .and_then(Quote::spread_bps)
            .map(|bps| bps <= 20.0)
            .unwrap_or(false);
        if liquid && tight && candidate.composite_score.abs() >= 0.5 {
            EntryType::Market
        } else {
            EntryType::Limit
        }
    }

    /// Run every gate over `candidates` and return the approved orders plus
    /// the rejection record for everything that did not make it.
    pub fn evaluate(
        &self,
        candidates: &[Candidate],
        regime: &Regime,
        config: &RuntimeConfig,
        quotes: &HashMap<String, Quote>,
        exposure: &BookExposure,
        produced_by: &ProducedBy,
    ) -> RiskDecision {
        let mut approved = Vec::new();
        let mut rejections: Vec<RiskRejection> = Vec::new();

        // Deterministic processing order: strongest conviction first, symbol
        // as the tie-break.
        let mut ordered: Vec<&Candidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| {
            b.composite_score
                .abs()
                .partial_cmp(&a.composite_score.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        let mut risk_budget = self.params.daily_loss_floor - exposure.open_risk;
        let mut open_trades = exposure.open_trades;
        let mut sector_counts = exposure.sector_counts.clone();

        for candidate in ordered {
            let reject = |reason: String, rejections: &mut Vec<RiskRejection>| {
                debug!(symbol = %candidate.symbol, reason = %reason, "candidate rejected");
                rejections.push(RiskRejection {
                    symbol: candidate.symbol.clone(),
                    candidate_id: candidate.candidate_id.clone(),
                    reason,
                });
            };

            if regime.position_multiplier == 0.0 {
                reject("regime multiplier is zero".to_string(), &mut rejections);
                continue;
            }

            let entry_price = Self::entry_price(candidate);
            let stop_distance = (entry_price - candidate.stop_loss).abs();
            let lot_size = config.lot_size(&candidate.symbol);
            let quantity =
                self.size_quantity(stop_distance, regime.position_multiplier, lot_size);
            if quantity == 0 {
                reject(
                    format!("sizing produced zero quantity (stop distance {stop_distance:.2}, lot {lot_size})"),
                    &mut rejections,
                );
                continue;
            }

            if open_trades >= self.params.max_open_trades {
                reject(
                    format!("book already holds {open_trades} trades"),
                    &mut rejections,
                );
                continue;
            }

            let sector = config.sector(&candidate.symbol);
            let in_sector = sector_counts.get(&sector).copied().unwrap_or(0);
            if in_sector >= self.params.sector_cap {
                reject(
                    format!("sector {sector} already at cap {in_sector}"),
                    &mut rejections,
                );
                continue;
            }

            let trade_risk = quantity as f64 * stop_distance;
            if trade_risk > risk_budget {
                reject(
                    format!(
                        "daily risk budget exhausted (needs {trade_risk:.0}, {risk_budget:.0} left)"
                    ),
                    &mut rejections,
                );
                continue;
            }

            let entry_type = self.entry_type(candidate, quotes.get(&candidate.symbol));
            let tag = format!("{}:{}", candidate.candidate_id, candidate.symbol);

            match ApprovedOrder::new(
                candidate,
                quantity,
                entry_type,
                entry_price,
                lot_size,
                self.params.per_trade_risk,
                tag,
                produced_by.clone(),
            ) {
                Ok(order) => {
                    risk_budget -= trade_risk;
                    open_trades += 1;
                    *sector_counts.entry(sector).or_insert(0) += 1;
                    info!(
                        symbol = %order.symbol,
                        direction = %order.direction,
                        quantity = order.quantity,
                        entry_type = %order.entry_type,
                        risk = trade_risk,
                        "order approved"
                    );
                    approved.push(order);
                }
                Err(e) => {
                    warn!(symbol = %candidate.symbol, error = %e, "approved order failed validation");
                    reject(format!("validation failed: {e}"), &mut rejections);
                }
            }
        }

        RiskDecision {
            approved,
            rejections,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::RegimeState;

    fn produced() -> ProducedBy {
        ProducedBy::new("intraday_analysis", "risk_sizing", "run-1")
    }

    fn candidate(symbol: &str, entry_low: f64, entry_high: f64, sl: f64, tp: f64) -> Candidate {
        Candidate::new(
            format!("c-{symbol}"),
            symbol,
            Direction::Long,
            0.8,
            0.8,
            entry_low,
            entry_high,
            sl,
            tp,
            1.0,
            Vec::new(),
            produced(),
        )
        .unwrap()
    }

    fn engine() -> RiskEngine {
        RiskEngine::new(RiskParams::default(), ExecutionParams::default())
    }

    fn calm() -> Regime {
        Regime::new(RegimeState::Calm, 11.0, 1.0, produced()).unwrap()
    }

    #[test]
    fn sizing_matches_risk_budget() {
        let e = engine();
        // 500 rupee budget / 1.0 stop distance = 500 shares.
        assert_eq!(e.size_quantity(1.0, 1.0, 1), 500);
        // Halved multiplier halves the size.
        assert_eq!(e.size_quantity(1.0, 0.5, 1), 250);
        // Lot rounding floors.
        assert_eq!(e.size_quantity(1.0, 1.0, 150), 450);
        // Degenerate stop distance sizes to zero.
        assert_eq!(e.size_quantity(0.0, 1.0, 1), 0);
    }

    #[test]
    fn multiplier_above_one_never_breaks_the_cap() {
        let e = engine();
        // Even a 1.5x regime cannot push risk past per_trade_risk.
        assert_eq!(e.size_quantity(1.0, 1.5, 1), 500);
    }

    #[test]
    fn calm_day_long_sizes_to_500() {
        let e = engine();
        let cfg = RuntimeConfig::default();
        let cands = vec![candidate("NSE:RELIANCE-EQ", 100.0, 100.2, 99.0, 101.2)];

        let decision = e.evaluate(
            &cands,
            &calm(),
            &cfg,
            &HashMap::new(),
            &BookExposure::default(),
            &produced(),
        );

        assert_eq!(decision.approved.len(), 1);
        let order = &decision.approved[0];
        assert_eq!(order.quantity, 500);
        assert_eq!(order.entry_price, 100.0);
        assert_eq!(order.entry_type, EntryType::Limit);
        assert!((order.risk_at_stop() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn halt_regime_approves_nothing() {
        let e = engine();
        let cfg = RuntimeConfig::default();
        let halt = Regime::new(RegimeState::Halt, 35.0, 0.0, produced()).unwrap();
        let cands = vec![candidate("NSE:RELIANCE-EQ", 100.0, 100.2, 99.0, 101.2)];

        let decision = e.evaluate(
            &cands,
            &halt,
            &cfg,
            &HashMap::new(),
            &BookExposure::default(),
            &produced(),
        );
        assert!(decision.approved.is_empty());
        assert_eq!(decision.rejections.len(), 1);
    }

    #[test]
    fn daily_floor_bounds_cumulative_risk() {
        let e = engine();
        let cfg = RuntimeConfig::default();
        // Six candidates at 500 risk each against a 2500 floor: five fit.
        let cands: Vec<Candidate> = (0..6)
            .map(|i| candidate(&format!("NSE:SYM{i}-EQ"), 100.0, 100.2, 99.0, 101.2))
            .collect();

        let decision = e.evaluate(
            &cands,
            &calm(),
            &cfg,
            &HashMap::new(),
            &BookExposure::default(),
            &produced(),
        );

        assert_eq!(decision.approved.len(), 5);
        assert_eq!(decision.rejections.len(), 1);
        let total: f64 = decision.approved.iter().map(|o| o.risk_at_stop()).sum();
        assert!(total <= RiskParams::default().daily_loss_floor + 1e-9);
    }

    #[test]
    fn existing_open_risk_shrinks_the_budget() {
        let e = engine();
        let cfg = RuntimeConfig::default();
        let cands: Vec<Candidate> = (0..3)
            .map(|i| candidate(&format!("NSE:SYM{i}-EQ"), 100.0, 100.2, 99.0, 101.2))
            .collect();

        let exposure = BookExposure {
            open_risk: 2_000.0,
            open_trades: 2,
            sector_counts: HashMap::new(),
        };
        let decision = e.evaluate(&cands, &calm(), &cfg, &HashMap::new(), &exposure, &produced());
        // Only 500 of floor headroom left: one order fits.
        assert_eq!(decision.approved.len(), 1);
    }

    #[test]
    fn sector_cap_enforced() {
        let e = engine();
        let mut cfg = RuntimeConfig::default();
        for i in 0..4 {
            cfg.sectors
                .insert(format!("NSE:BANK{i}-EQ"), "BANKS".to_string());
        }
        let cands: Vec<Candidate> = (0..4)
            .map(|i| candidate(&format!("NSE:BANK{i}-EQ"), 100.0, 100.2, 99.5, 101.2))
            .collect();

        let decision = e.evaluate(
            &cands,
            &calm(),
            &cfg,
            &HashMap::new(),
            &BookExposure::default(),
            &produced(),
        );
        assert_eq!(decision.approved.len(), 2);
        assert!(decision
            .rejections
            .iter()
            .all(|r| r.reason.contains("sector")));
    }

    #[test]
    fn liquid_momentum_goes_market() {
        let e = engine();
        let cfg = RuntimeConfig::default();
        let cands = vec![candidate("NSE:RELIANCE-EQ", 100.0, 100.2, 99.0, 101.2)];
        let mut quotes = HashMap::new();
        quotes.insert(
            "NSE:RELIANCE-EQ".to_string(),
            Quote {
                symbol: "NSE:RELIANCE-EQ".to_string(),
                last_price: 100.1,
                change_pct: 0.5,
                volume: 5_000_000.0,
                bid: 100.05,
                ask: 100.15,
            },
        );

        let decision = e.evaluate(
            &cands,
            &calm(),
            &cfg,
            &quotes,
            &BookExposure::default(),
            &produced(),
        );
        assert_eq!(decision.approved[0].entry_type, EntryType::Market);
    }
}
