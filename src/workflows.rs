// =============================================================================
// Workflow Definitions — the five market-hours workflows
// =============================================================================
//
//   intraday_analysis    09:00  regime -> gate -> research group ->
//                               synthesis -> risk sizing
//   order_execution      09:15  drive approved orders through the broker
//   position_monitoring  09:30+ one monitor pass per trigger
//   news_digest          hourly condense news, merge additively
//   post_trade_analysis  16:00  day report from history + ledger
//
// Function stages here are the deterministic glue between the pluggable
// analysts and the execution/monitoring engines.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::analysts::{
    FlowAnalyst, NewsAnalyst, OptionsAnalyst, RegimeAnalyst, TechnicalAnalyst,
};
use crate::artifacts::{
    AnalystAccuracy, Artifact, Candidate, DayReport, StockSignal, CANDIDATE_MIN_CONFIDENCE,
};
use crate::execution::ExecutionEngine;
use crate::indicators::atr::calculate_atr;
use crate::ledger::{TradeLedger, TradeStatus};
use crate::monitor::PositionMonitor;
use crate::risk::{BookExposure, RiskEngine};
use crate::scheduler::Clock;
use crate::store::SessionStore;
use crate::types::{Direction, Resolution};
use crate::workflow::{
    Analyst, QuorumPolicy, Stage, StageCtx, StageFn, StageOutcome, Workflow,
};

pub const INTRADAY_ANALYSIS: &str = "intraday_analysis";
pub const ORDER_EXECUTION: &str = "order_execution";
pub const POSITION_MONITORING: &str = "position_monitoring";
pub const NEWS_DIGEST: &str = "news_digest";
pub const POST_TRADE_ANALYSIS: &str = "post_trade_analysis";

/// Session-state keys shared between workflows.
pub mod keys {
    pub const REGIME: &str = "regime";
    pub const CANDIDATES: &str = "candidates";
    pub const APPROVED_ORDERS: &str = "approved_orders";
    pub const RISK_REJECTIONS: &str = "risk_rejections";
    pub const EXECUTION_REPORT: &str = "execution_report";
    pub const DIGEST: &str = "digest";
    pub const MONITOR_ACTIONS: &str = "monitor_actions";
    pub const DAY_REPORT: &str = "day_report";
}

// ---------------------------------------------------------------------------
// Intraday analysis stages
// ---------------------------------------------------------------------------

/// Persists the regime into session state and short-circuits the run before
/// any research stage when the regime is HALT.
pub struct RegimeGateStage;

#[async_trait]
impl StageFn for RegimeGateStage {
    async fn call(&self, ctx: &StageCtx) -> Result<StageOutcome> {
        let regime = ctx
            .previous_step_content()
            .and_then(Artifact::as_regime)
            .cloned()
            .ok_or_else(|| anyhow!("regime gate needs a Regime artifact from the prior stage"))?;

        ctx.state_set(keys::REGIME, Artifact::Regime(regime.clone()))?;

        if regime.is_halt() {
            // Leave an explicit empty decision trail for the executor.
            ctx.state_set(keys::CANDIDATES, Artifact::Candidates(Vec::new()))?;
            ctx.state_set(keys::APPROVED_ORDERS, Artifact::ApprovedOrders(Vec::new()))?;
            return Ok(StageOutcome::Halt {
                reason: format!("regime HALT (vix {:.1})", regime.vix),
            });
        }

        Ok(StageOutcome::Artifact(Artifact::Note(
            json!({ "gate": "pass", "state": regime.state.to_string() }),
        )))
    }
}

/// Merges the research group's StockSignals into Candidates with explicit
/// entry range, stop, and target.
pub struct SynthesisStage;

impl SynthesisStage {
    /// Composite score in [-1, 1]: confidence-weighted mean of normalized
    /// member scores.
    fn composite(signals: &[StockSignal]) -> f64 {
        let weight: f64 = signals.iter().map(|s| s.confidence).sum();
        if weight == 0.0 {
            return 0.0;
        }
        signals
            .iter()
            .map(|s| s.normalized_score() * s.confidence)
            .sum::<f64>()
            / weight
    }
}

#[async_trait]
impl StageFn for SynthesisStage {
    async fn call(&self, ctx: &StageCtx) -> Result<StageOutcome> {
        let research = ctx
            .get_step_content("research")
            .ok_or_else(|| anyhow!("synthesis needs the research group output"))?;
        let members = research
            .as_group()
            .ok_or_else(|| anyhow!("research output is not a group"))?;

        // Collect member signals per symbol, deterministically ordered.
        let mut by_symbol: BTreeMap<String, Vec<StockSignal>> = BTreeMap::new();
        for artifact in members.values() {
            if let Some(signals) = artifact.as_signals() {
                for s in signals {
                    by_symbol.entry(s.symbol.clone()).or_default().push(s.clone());
                }
            }
        }

        let target_move_pct = ctx.config.risk.target_move_pct;
        let to = Utc::now();
        let from = to - ChronoDuration::days(5);
        let mut candidates = Vec::new();

        for (symbol, signals) in by_symbol {
            ctx.check_cancelled()?;

            let composite = Self::composite(&signals);
            if composite.abs() < 0.3 {
                debug!(symbol = %symbol, composite, "conviction below candidate threshold");
                continue;
            }
            let confidence = signals
                .iter()
                .map(|s| s.confidence)
                .fold(0.0_f64, f64::max);
            if confidence < CANDIDATE_MIN_CONFIDENCE {
                debug!(symbol = %symbol, confidence, "confidence below emit threshold");
                continue;
            }

            let Some(last) = ctx
                .broker
                .get_quote(&[symbol.clone()])
                .await
                .ok()
                .and_then(|mut q| q.pop())
                .map(|q| q.last_price)
            else {
                warn!(symbol = %symbol, "no quote — candidate skipped");
                continue;
            };

            let atr = ctx
                .broker
                .get_history(&symbol, Resolution::M15, from, to)
                .await
                .ok()
                .and_then(|candles| calculate_atr(&candles, 14))
                .unwrap_or(last * 0.01);

            let direction = if composite > 0.0 {
                Direction::Long
            } else {
                Direction::Short
            };

            // Entry at touch with a two-tick band in the trade's direction so
            // a limit at the near edge is immediately workable.
            let (entry_low, entry_high) = match direction {
                Direction::Long => (last, last * 1.002),
                Direction::Short => (last * 0.998, last),
            };
            let entry_mid = (entry_low + entry_high) / 2.0;
            let stop_distance = (1.5 * atr).max(0.004 * last);
            let target_distance =
                (2.5 * atr).max(target_move_pct / 100.0 * entry_mid * 1.1);

            let (stop_loss, take_profit) = match direction {
                Direction::Long => (entry_low - stop_distance, entry_high + target_distance),
                Direction::Short => (entry_high + stop_distance, entry_low - target_distance),
            };

            match Candidate::new(
                format!("{}-{}", ctx.session_id, symbol),
                symbol.clone(),
                direction,
                composite,
                confidence,
                entry_low,
                entry_high,
                stop_loss,
                take_profit,
                target_move_pct,
                signals,
                ctx.produced_by(),
            ) {
                Ok(c) => candidates.push(c),
                Err(e) => warn!(symbol = %symbol, error = %e, "candidate failed validation — skipped"),
            }
        }

        info!(candidates = candidates.len(), "synthesis complete");
        ctx.state_set(keys::CANDIDATES, Artifact::Candidates(candidates.clone()))?;
        Ok(StageOutcome::Artifact(Artifact::Candidates(candidates)))
    }
}

/// Applies the risk engine to the candidate set and records approved orders
/// into session state for the execution workflow.
pub struct RiskSizingStage {
    pub ledger: Arc<TradeLedger>,
}

#[async_trait]
impl StageFn for RiskSizingStage {
    async fn call(&self, ctx: &StageCtx) -> Result<StageOutcome> {
        let regime = ctx
            .state_get(keys::REGIME)
            .and_then(|a| a.as_regime().cloned())
            .ok_or_else(|| anyhow!("risk sizing needs the regime in session state"))?;
        let candidates: Vec<Candidate> = ctx
            .previous_step_content()
            .and_then(Artifact::as_candidates)
            .map(<[Candidate]>::to_vec)
            .unwrap_or_default();

        let symbols: Vec<String> = candidates.iter().map(|c| c.symbol.clone()).collect();
        let quotes = if symbols.is_empty() {
            Vec::new()
        } else {
            ctx.broker.get_quote(&symbols).await.unwrap_or_default()
        };
        let quotes = quotes
            .into_iter()
            .map(|q| (q.symbol.clone(), q))
            .collect();

        // Exposure already on the book counts against today's budget.
        let mut exposure = BookExposure::default();
        for trade in self.ledger.live_trades(&ctx.session_id) {
            exposure.open_risk += match trade.status {
                TradeStatus::Working => trade.order.risk_at_stop(),
                _ => trade.worst_case_loss(),
            };
            exposure.open_trades += 1;
            *exposure
                .sector_counts
                .entry(ctx.config.sector(&trade.order.symbol))
                .or_insert(0) += 1;
        }

        let engine = RiskEngine::new(ctx.config.risk.clone(), ctx.config.execution.clone());
        let decision = engine.evaluate(
            &candidates,
            &regime,
            &ctx.config,
            &quotes,
            &exposure,
            &ctx.produced_by(),
        );

        ctx.state_set(
            keys::APPROVED_ORDERS,
            Artifact::ApprovedOrders(decision.approved.clone()),
        )?;
        ctx.state_set(
            keys::RISK_REJECTIONS,
            Artifact::Note(json!(decision.rejections)),
        )?;

        Ok(StageOutcome::Artifact(Artifact::ApprovedOrders(
            decision.approved,
        )))
    }
}

// ---------------------------------------------------------------------------
// Execution / monitoring / news / post-trade stages
// ---------------------------------------------------------------------------

/// Reads the analysis session's approved orders (cross-workflow) and drives
/// them through the execution engine.  An empty set completes with zero
/// trades and run status OK.
pub struct ExecuteApprovedStage {
    pub engine: Arc<ExecutionEngine>,
}

#[async_trait]
impl StageFn for ExecuteApprovedStage {
    async fn call(&self, ctx: &StageCtx) -> Result<StageOutcome> {
        ctx.check_cancelled()?;
        let orders = ctx
            .cross_session(INTRADAY_ANALYSIS, &ctx.session_id)
            .and_then(|s| s.session_state.get(keys::APPROVED_ORDERS).cloned())
            .and_then(|a| a.as_approved_orders().map(<[_]>::to_vec))
            .unwrap_or_default();

        if orders.is_empty() {
            info!(session_id = %ctx.session_id, "no approved orders — nothing to execute");
        }

        let report = self.engine.execute_batch(&orders, &ctx.session_id).await;
        let artifact = Artifact::Note(json!(report));
        ctx.state_set(keys::EXECUTION_REPORT, artifact.clone())?;
        Ok(StageOutcome::Artifact(artifact))
    }
}

/// One position-monitor pass per trigger, fed by the latest committed news
/// digest.
pub struct MonitorStage {
    pub monitor: Arc<PositionMonitor>,
    pub clock: Arc<dyn Clock>,
    pub timezone: Tz,
}

#[async_trait]
impl StageFn for MonitorStage {
    async fn call(&self, ctx: &StageCtx) -> Result<StageOutcome> {
        ctx.check_cancelled()?;
        let now_local = self
            .clock
            .now_utc()
            .with_timezone(&self.timezone)
            .time();

        let digest = ctx
            .cross_session(NEWS_DIGEST, &ctx.session_id)
            .and_then(|s| s.session_state.get(keys::DIGEST).cloned())
            .and_then(|a| a.as_news().cloned());

        let actions = self
            .monitor
            .run_pass(&ctx.session_id, now_local, digest.as_ref())
            .await?;

        let artifact = Artifact::Note(json!(actions));
        ctx.state_set(keys::MONITOR_ACTIONS, artifact.clone())?;
        Ok(StageOutcome::Artifact(artifact))
    }
}

/// Folds the fresh digest into the day's running digest.  Digests are
/// additive within a trading day; a tolerated upstream failure (Null) keeps
/// the existing digest.
pub struct NewsMergeStage;

#[async_trait]
impl StageFn for NewsMergeStage {
    async fn call(&self, ctx: &StageCtx) -> Result<StageOutcome> {
        let prior = ctx
            .state_get(keys::DIGEST)
            .and_then(|a| a.as_news().cloned());

        let fresh = match ctx.previous_step_content() {
            Some(Artifact::News(d)) => d.clone(),
            _ => {
                return Ok(StageOutcome::Artifact(
                    prior.map(Artifact::News).unwrap_or(Artifact::Null),
                ))
            }
        };

        let merged = match &prior {
            Some(p) => fresh.merge(p),
            None => fresh,
        };

        ctx.state_set(keys::DIGEST, Artifact::News(merged.clone()))?;
        Ok(StageOutcome::Artifact(Artifact::News(merged)))
    }
}

/// End-of-day self-evaluation: P&L roll-up, hit rate, and per-analyst
/// prediction accuracy against the trade ledger.
pub struct DayReportStage {
    pub ledger: Arc<TradeLedger>,
    pub store: Arc<SessionStore>,
}

impl DayReportStage {
    fn analyst_accuracy(&self, up_to_session: &str) -> Vec<AnalystAccuracy> {
        let sessions = self
            .store
            .sessions_between(INTRADAY_ANALYSIS, "0000-01-01", up_to_session)
            .unwrap_or_default();

        let mut tallies: BTreeMap<String, (u32, u32)> = BTreeMap::new();
        for session in &sessions {
            let Some(candidates) = session
                .session_state
                .get(keys::CANDIDATES)
                .and_then(Artifact::as_candidates)
            else {
                continue;
            };
            for candidate in candidates {
                let day_pnl: Option<f64> = {
                    let trades: Vec<_> = self
                        .ledger
                        .by_date(&session.session_id)
                        .into_iter()
                        .filter(|t| {
                            t.order.symbol == candidate.symbol && t.realized_pnl.is_some()
                        })
                        .collect();
                    if trades.is_empty() {
                        None
                    } else {
                        Some(trades.iter().filter_map(|t| t.realized_pnl).sum())
                    }
                };
                let Some(pnl) = day_pnl else {
                    continue;
                };
                for signal in &candidate.contributing_signals {
                    let entry = tallies.entry(signal.analyst_id.clone()).or_insert((0, 0));
                    entry.0 += 1;
                    // A signal counts as correct when the trade it fed ended
                    // profitable.
                    if pnl > 0.0 {
                        entry.1 += 1;
                    }
                }
            }
        }

        tallies
            .into_iter()
            .map(|(analyst_id, (signals, correct))| AnalystAccuracy {
                analyst_id,
                signals,
                correct,
                accuracy: if signals > 0 {
                    correct as f64 / signals as f64
                } else {
                    0.0
                },
            })
            .collect()
    }
}

#[async_trait]
impl StageFn for DayReportStage {
    async fn call(&self, ctx: &StageCtx) -> Result<StageOutcome> {
        let session_id = ctx.session_id.clone();
        let trades = self.ledger.by_date(&session_id);

        let realized = self.ledger.realized_pnl(&session_id);
        let closed: Vec<_> = trades
            .iter()
            .filter(|t| t.status.is_terminal() && t.realized_pnl.is_some())
            .collect();
        let wins = closed
            .iter()
            .filter(|t| t.realized_pnl.unwrap_or(0.0) > 0.0)
            .count();
        let hit_rate = if closed.is_empty() {
            0.0
        } else {
            wins as f64 / closed.len() as f64
        };

        // Anything still open is marked to the latest quote.
        let open: Vec<_> = trades
            .iter()
            .filter(|t| t.status == TradeStatus::Open)
            .collect();
        let mut unrealized = 0.0;
        if !open.is_empty() {
            let symbols: Vec<String> = open.iter().map(|t| t.order.symbol.clone()).collect();
            if let Ok(quotes) = ctx.broker.get_quote(&symbols).await {
                let prices: BTreeMap<&str, f64> = quotes
                    .iter()
                    .map(|q| (q.symbol.as_str(), q.last_price))
                    .collect();
                for trade in &open {
                    if let Some(&price) = prices.get(trade.order.symbol.as_str()) {
                        unrealized += trade.unrealized_pnl(price);
                    }
                }
            }
        }

        // The rolling history keeps the evaluation anchored to what was
        // actually predicted on earlier days.
        let history_depth = ctx.config.history_depth;
        let history = ctx.history_of(INTRADAY_ANALYSIS, history_depth);
        let analyst_accuracy = self.analyst_accuracy(&session_id);

        let mut lessons = Vec::new();
        if !closed.is_empty() && hit_rate < 0.5 {
            lessons.push(format!(
                "hit rate {hit_rate:.2} below 0.50 across {} closed trades",
                closed.len()
            ));
        }
        if realized < 0.0 {
            lessons.push(format!("negative day: realized {realized:.0}"));
        }
        for acc in &analyst_accuracy {
            if acc.signals >= 3 && acc.accuracy < 0.4 {
                lessons.push(format!(
                    "analyst {} below 40% accuracy over {} signals",
                    acc.analyst_id, acc.signals
                ));
            }
        }
        if lessons.is_empty() && !closed.is_empty() {
            lessons.push("book behaved within plan".to_string());
        }

        info!(
            session_id = %session_id,
            realized,
            unrealized,
            hit_rate,
            history_runs = history.len(),
            "day report assembled"
        );

        let report = DayReport {
            date: session_id,
            realized_pnl: realized,
            unrealized_pnl: unrealized,
            hit_rate,
            analyst_accuracy,
            lessons,
            produced_by: ctx.produced_by(),
        };

        ctx.state_set(keys::DAY_REPORT, Artifact::Report(report.clone()))?;
        Ok(StageOutcome::Artifact(Artifact::Report(report)))
    }
}

// ---------------------------------------------------------------------------
// Workflow builders
// ---------------------------------------------------------------------------

pub fn intraday_analysis(ledger: Arc<TradeLedger>) -> Workflow {
    Workflow::new(
        INTRADAY_ANALYSIS,
        vec![
            Stage::agent("regime", Arc::new(RegimeAnalyst)),
            Stage::function("regime_gate", Arc::new(RegimeGateStage)),
            Stage::parallel(
                "research",
                vec![
                    (
                        "technical".to_string(),
                        Arc::new(TechnicalAnalyst) as Arc<dyn Analyst>,
                    ),
                    ("flow".to_string(), Arc::new(FlowAnalyst) as Arc<dyn Analyst>),
                    (
                        "options".to_string(),
                        Arc::new(OptionsAnalyst) as Arc<dyn Analyst>,
                    ),
                ],
                QuorumPolicy::AtLeast(2),
            ),
            Stage::function("synthesis", Arc::new(SynthesisStage)),
            Stage::function("risk_sizing", Arc::new(RiskSizingStage { ledger })),
        ],
    )
}

pub fn order_execution(engine: Arc<ExecutionEngine>) -> Workflow {
    Workflow::new(
        ORDER_EXECUTION,
        vec![Stage::function(
            "execute_approved",
            Arc::new(ExecuteApprovedStage { engine }),
        )],
    )
}

pub fn position_monitoring(
    monitor: Arc<PositionMonitor>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
) -> Workflow {
    Workflow::new(
        POSITION_MONITORING,
        vec![Stage::function(
            "monitor_pass",
            Arc::new(MonitorStage {
                monitor,
                clock,
                timezone,
            }),
        )],
    )
}

pub fn news_digest() -> Workflow {
    Workflow::new(
        NEWS_DIGEST,
        vec![
            Stage::agent("news", Arc::new(NewsAnalyst)).tolerant(),
            Stage::function("merge_digest", Arc::new(NewsMergeStage)),
        ],
    )
}

pub fn post_trade_analysis(ledger: Arc<TradeLedger>, store: Arc<SessionStore>) -> Workflow {
    Workflow::new(
        POST_TRADE_ANALYSIS,
        vec![Stage::function(
            "day_report",
            Arc::new(DayReportStage { ledger, store }),
        )],
    )
}

// =============================================================================
// End-to-end tests (seed scenarios)
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysts::VIX_SYMBOL;
    use crate::artifacts::Sentiment;
    use crate::audit::AuditLog;
    use crate::broker::sim::SimBroker;
    use crate::broker::BrokerPort;
    use crate::config::{ExecutionParams, RuntimeConfig};
    use crate::market_data::{FlowSegment, FlowSnapshot, NewsItem, StaticMarketData};
    use crate::store::RunStatus;
    use crate::types::Candle;
    use crate::workflow::engine::WorkflowEngine;
    use crate::workflow::CancelFlag;

    const SYM: &str = "NSE:RELIANCE-EQ";
    const DAY: &str = "2026-07-30";

    struct Fixture {
        _dir: tempfile::TempDir,
        sim: Arc<SimBroker>,
        market: Arc<StaticMarketData>,
        store: Arc<SessionStore>,
        ledger: Arc<TradeLedger>,
        exec: Arc<ExecutionEngine>,
        engine: WorkflowEngine,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(SimBroker::new());
        let broker: Arc<dyn BrokerPort> = Arc::clone(&sim) as _;
        let market = Arc::new(StaticMarketData::new());
        let store = Arc::new(SessionStore::new(dir.path().join("sessions")));
        let ledger = Arc::new(TradeLedger::open(dir.path().join("ledger")).unwrap());
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));

        let mut config = RuntimeConfig::default();
        config.universe = vec![SYM.to_string()];
        config.execution = ExecutionParams {
            entry_wait_secs: 0,
            ..ExecutionParams::default()
        };
        let config = Arc::new(config);

        let exec = Arc::new(ExecutionEngine::new(
            Arc::clone(&broker),
            Arc::clone(&ledger),
            Arc::clone(&audit),
            config.execution.clone(),
            None,
        ));

        let engine = WorkflowEngine::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            Arc::clone(&market) as Arc<dyn crate::market_data::MarketDataPort>,
            Arc::clone(&config),
            None,
        );

        Fixture {
            _dir: dir,
            sim,
            market,
            store,
            ledger,
            exec,
            engine,
        }
    }

    /// Strong uptrend intraday candles for the technical analyst and ATR.
    fn uptrend_history() -> Vec<Candle> {
        let now = Utc::now().timestamp();
        (0..120)
            .map(|i| {
                let close = 100.0 + i as f64 * 0.5;
                Candle {
                    ts: now - (120 - i) * 900,
                    open: close - 0.3,
                    high: close + 0.5,
                    low: close - 0.5,
                    close,
                    volume: 50_000.0,
                }
            })
            .collect()
    }

    async fn run_intraday(f: &Fixture) -> crate::store::WorkflowRun {
        let wf = intraday_analysis(Arc::clone(&f.ledger));
        f.engine
            .execute(&wf, DAY, json!("scheduled"), CancelFlag::new())
            .await
            .unwrap()
    }

    async fn run_execution(f: &Fixture) -> crate::store::WorkflowRun {
        let wf = order_execution(Arc::clone(&f.exec));
        f.engine
            .execute(&wf, DAY, json!("scheduled"), CancelFlag::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn halt_path_produces_no_candidates_and_executes_zero_trades() {
        let f = fixture();
        f.sim.set_price(VIX_SYMBOL, 35.0);

        let analysis = run_intraday(&f).await;
        assert_eq!(analysis.status, RunStatus::Halt);
        // The run ends after the gate: regime + gate, no research output.
        assert_eq!(analysis.step_outputs.len(), 2);
        assert!(analysis.step_outputs[1].artifact.is_halt());

        let session = f.store.load(INTRADAY_ANALYSIS, DAY).unwrap().unwrap();
        assert_eq!(
            session.session_state.get(keys::CANDIDATES),
            Some(&Artifact::Candidates(Vec::new()))
        );

        // The 09:15 executor reads the empty set and completes OK.
        let execution = run_execution(&f).await;
        assert_eq!(execution.status, RunStatus::Ok);
        assert!(f.ledger.by_date(DAY).is_empty());
    }

    #[tokio::test]
    async fn calm_day_pipeline_opens_and_takes_profit() {
        let f = fixture();
        f.sim.set_price(VIX_SYMBOL, 11.0);
        f.sim.set_price(SYM, 160.0);
        f.sim.set_volume(SYM, 2_000_000.0);
        f.sim.set_history(SYM, uptrend_history());
        f.market.push_flow(FlowSnapshot {
            date: DAY.parse().unwrap(),
            segment: FlowSegment::ForeignInstitutional,
            gross_buy: 1_800.0,
            gross_sell: 1_000.0,
        });

        let analysis = run_intraday(&f).await;
        assert_eq!(analysis.status, RunStatus::Ok);

        let approved = analysis
            .state_snapshot
            .get(keys::APPROVED_ORDERS)
            .and_then(Artifact::as_approved_orders)
            .unwrap();
        assert_eq!(approved.len(), 1, "one long candidate should be approved");
        let order = &approved[0];
        assert_eq!(order.direction, Direction::Long);
        assert!(order.risk_at_stop() <= 500.0 + 1e-9);

        let execution = run_execution(&f).await;
        assert_eq!(execution.status, RunStatus::Ok);

        let trades = f.ledger.by_date(DAY);
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].status, TradeStatus::Open);

        // Tape runs through the target: the TP child fires and the trade
        // closes in profit.
        let mut rx = f.sim.subscribe_orders();
        f.sim.set_price(SYM, trades[0].order.take_profit + 0.5);
        while let Ok(update) = rx.try_recv() {
            f.exec.process_update(&update).unwrap();
        }

        let done = f.ledger.get(&trades[0].trade_id).unwrap();
        assert_eq!(done.status, TradeStatus::Closed);
        assert!(done.realized_pnl.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn news_digest_merges_additively_across_runs() {
        let f = fixture();
        let wf = news_digest();

        f.market.push_news(NewsItem {
            headline: "RBI policy steady".to_string(),
            source: "wire".to_string(),
            symbols: vec!["NSE:HDFCBANK-EQ".to_string()],
            sentiment_hint: Some(Sentiment::Neutral),
            published_at: Utc::now() - ChronoDuration::hours(2),
        });
        let first = f
            .engine
            .execute(&wf, DAY, json!("hourly"), CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(first.status, RunStatus::Ok);

        f.market.push_news(NewsItem {
            headline: "Global risk-off on crude spike".to_string(),
            source: "wire".to_string(),
            symbols: vec![SYM.to_string()],
            sentiment_hint: Some(Sentiment::RiskOff),
            published_at: Utc::now(),
        });
        f.engine
            .execute(&wf, DAY, json!("hourly"), CancelFlag::new())
            .await
            .unwrap();

        let session = f.store.load(NEWS_DIGEST, DAY).unwrap().unwrap();
        let digest = session
            .session_state
            .get(keys::DIGEST)
            .and_then(|a| a.as_news())
            .unwrap();
        // Both headlines survive; the later risk-off sentiment wins.
        assert_eq!(digest.key_events.len(), 2);
        assert_eq!(digest.sentiment, Sentiment::RiskOff);
        assert!(digest.affected_symbols.contains(&SYM.to_string()));
    }

    #[tokio::test]
    async fn monitoring_workflow_runs_clean_on_empty_book() {
        let f = fixture();
        let audit = Arc::new(AuditLog::new(f._dir.path().join("audit2.jsonl")));
        let monitor = Arc::new(PositionMonitor::new(
            Arc::clone(&f.sim) as Arc<dyn BrokerPort>,
            Arc::clone(&f.ledger),
            Arc::clone(&f.exec),
            Arc::new(RuntimeConfig::default()),
            audit,
        ));
        let clock: Arc<dyn Clock> = Arc::new(crate::scheduler::SystemClock);
        let tz: Tz = "Asia/Kolkata".parse().unwrap();

        let wf = position_monitoring(monitor, clock, tz);
        let run = f
            .engine
            .execute(&wf, DAY, json!("tick"), CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Ok);
        assert_eq!(
            run.state_snapshot.get(keys::MONITOR_ACTIONS),
            Some(&Artifact::Note(json!([])))
        );
    }

    #[tokio::test]
    async fn post_trade_reads_history_across_days() {
        let f = fixture();
        f.sim.set_price(VIX_SYMBOL, 11.0);
        f.sim.set_volume(SYM, 2_000_000.0);
        f.market.push_flow(FlowSnapshot {
            date: "2026-07-28".parse().unwrap(),
            segment: FlowSegment::ForeignInstitutional,
            gross_buy: 1_800.0,
            gross_sell: 1_000.0,
        });
        f.market.push_flow(FlowSnapshot {
            date: "2026-07-29".parse().unwrap(),
            segment: FlowSegment::ForeignInstitutional,
            gross_buy: 1_800.0,
            gross_sell: 1_000.0,
        });

        // Two prior intraday sessions with candidates and closed trades.
        for day in ["2026-07-28", "2026-07-29"] {
            f.sim.set_price(SYM, 160.0);
            f.sim.set_history(SYM, uptrend_history());
            let wf = intraday_analysis(Arc::clone(&f.ledger));
            let run = f
                .engine
                .execute(&wf, day, json!("scheduled"), CancelFlag::new())
                .await
                .unwrap();
            assert_eq!(run.status, RunStatus::Ok);

            let approved = run
                .state_snapshot
                .get(keys::APPROVED_ORDERS)
                .and_then(Artifact::as_approved_orders)
                .unwrap()
                .to_vec();
            let report = f.exec.execute_batch(&approved, day).await;
            assert_eq!(report.results[0].status, "OPEN");

            // Run each day's position to its target so the ledger records a
            // profitable close.
            let trades = f.ledger.by_date(day);
            let mut rx = f.sim.subscribe_orders();
            f.sim.set_price(SYM, trades[0].order.take_profit + 0.5);
            while let Ok(update) = rx.try_recv() {
                f.exec.process_update(&update).unwrap();
            }
        }

        // Day-3 post-trade run sees both prior intraday runs in history and
        // rolls accuracy up from the ledger.
        let wf = post_trade_analysis(Arc::clone(&f.ledger), Arc::clone(&f.store));
        let run = f
            .engine
            .execute(&wf, DAY, json!("scheduled"), CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Ok);

        let Some(Artifact::Report(report)) = run.state_snapshot.get(keys::DAY_REPORT).cloned()
        else {
            panic!("day report missing");
        };
        assert_eq!(report.date, DAY);
        assert!(!report.analyst_accuracy.is_empty());
        for acc in &report.analyst_accuracy {
            assert!(acc.signals >= 2, "both prior days contribute signals");
            assert!(acc.accuracy > 0.99, "profitable closes mark signals correct");
        }
    }
}
