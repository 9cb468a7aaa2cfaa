// =============================================================================
// Built-in Analysts — deterministic agent-stage bodies
// =============================================================================
//
// The Analyst trait is the plug point for external reasoning engines; these
// built-ins drive the pipeline end-to-end from indicator summaries and the
// auxiliary data ports.  Each one declares its score bounds and produces
// fully validated artifacts.
// =============================================================================

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use crate::artifacts::{
    Artifact, KeyEvent, NewsDigest, Regime, RegimeState, ScoreBounds, Sentiment, StockSignal,
};
use crate::indicators::ema::latest_ema;
use crate::indicators::macd;
use crate::indicators::options::{max_pain, put_call_ratio, StrikeRow};
use crate::indicators::rsi::latest_rsi;
use crate::indicators::volume::calculate_vwap;
use crate::types::{Candle, Resolution};
use crate::workflow::{Analyst, StageCtx};

/// Index symbol probed for the volatility regime.
pub const VIX_SYMBOL: &str = "NSE:INDIAVIX-INDEX";

// ---------------------------------------------------------------------------
// Regime analyst
// ---------------------------------------------------------------------------

/// Classifies the session into CALM / NORMAL / ELEVATED / HALT from the
/// volatility index and assigns the position multiplier the risk engine
/// scales by.
pub struct RegimeAnalyst;

#[async_trait]
impl Analyst for RegimeAnalyst {
    fn id(&self) -> &str {
        "regime"
    }

    async fn analyze(&self, ctx: &StageCtx) -> Result<Artifact> {
        ctx.check_cancelled()?;
        let quotes = ctx
            .broker
            .get_quote(&[VIX_SYMBOL.to_string()])
            .await
            .context("volatility index unavailable")?;
        let vix = quotes
            .first()
            .map(|q| q.last_price)
            .ok_or_else(|| anyhow!("volatility index returned no quote"))?;

        let (state, multiplier) = if vix < 13.0 {
            (RegimeState::Calm, 1.2)
        } else if vix < 17.0 {
            (RegimeState::Normal, 1.0)
        } else if vix < 25.0 {
            (RegimeState::Elevated, 0.5)
        } else {
            (RegimeState::Halt, 0.0)
        };

        debug!(vix, state = %state, multiplier, "regime classified");
        let regime = Regime::new(state, vix, multiplier, ctx.produced_by())?;
        Ok(Artifact::Regime(regime))
    }
}

// ---------------------------------------------------------------------------
// Technical analyst
// ---------------------------------------------------------------------------

/// Scores each universe symbol from trend, momentum, exhaustion, and the
/// session VWAP read on intraday candles.  Declared score range: [-10, 10].
pub struct TechnicalAnalyst;

impl TechnicalAnalyst {
    pub const BOUNDS: ScoreBounds = ScoreBounds::new(-10, 10);

    fn score_candles(candles: &[Candle]) -> Option<(i32, String)> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let e9 = latest_ema(&closes, 9)?;
        let e21 = latest_ema(&closes, 21)?;
        let hist = macd::calculate(&closes)?.histogram;
        let rsi = latest_rsi(&closes, 14)?;
        let last = *closes.last()?;

        let mut score = 0i32;
        let mut parts: Vec<&str> = Vec::new();

        if e9 > e21 {
            score += 4;
            parts.push("EMA stack bullish");
        } else {
            score -= 4;
            parts.push("EMA stack bearish");
        }

        if hist > 0.0 {
            score += 2;
            parts.push("MACD momentum up");
        } else {
            score -= 2;
            parts.push("MACD momentum down");
        }

        if rsi < 30.0 {
            score += 2;
            parts.push("RSI oversold");
        } else if rsi > 70.0 {
            score -= 1;
            parts.push("RSI stretched");
        }

        if let Some(vwap) = calculate_vwap(candles) {
            if last > vwap {
                score += 1;
                parts.push("above VWAP");
            } else {
                score -= 1;
                parts.push("below VWAP");
            }
        }

        Some((score.clamp(-10, 10), parts.join(", ")))
    }
}

#[async_trait]
impl Analyst for TechnicalAnalyst {
    fn id(&self) -> &str {
        "technical"
    }

    async fn analyze(&self, ctx: &StageCtx) -> Result<Artifact> {
        let to = Utc::now();
        let from = to - ChronoDuration::days(5);
        let mut signals = Vec::new();

        for symbol in &ctx.config.universe {
            ctx.check_cancelled()?;
            let candles = match ctx
                .broker
                .get_history(symbol, Resolution::M15, from, to)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "history unavailable — skipping symbol");
                    continue;
                }
            };
            let Some((score, rationale)) = Self::score_candles(&candles) else {
                debug!(symbol = %symbol, candles = candles.len(), "insufficient history for scoring");
                continue;
            };

            let confidence = (0.5 + 0.06 * score.unsigned_abs() as f64).min(0.95);
            signals.push(StockSignal::new(
                symbol.clone(),
                self.id(),
                score,
                Self::BOUNDS,
                confidence,
                rationale,
                Utc::now(),
                ctx.produced_by(),
            )?);
        }

        Ok(Artifact::Signals(signals))
    }
}

// ---------------------------------------------------------------------------
// Flow analyst
// ---------------------------------------------------------------------------

/// Tilts every universe symbol by the day's institutional flows.  Declared
/// score range: [-5, 5].  Missing flow data is a valid empty result, never
/// a failure.
pub struct FlowAnalyst;

impl FlowAnalyst {
    pub const BOUNDS: ScoreBounds = ScoreBounds::new(-5, 5);
}

#[async_trait]
impl Analyst for FlowAnalyst {
    fn id(&self) -> &str {
        "flow"
    }

    async fn analyze(&self, ctx: &StageCtx) -> Result<Artifact> {
        ctx.check_cancelled()?;
        let date = ctx
            .session_id
            .parse()
            .unwrap_or_else(|_| Utc::now().date_naive());
        let flows = ctx.market.institutional_flows(date).await;
        if flows.is_empty() {
            debug!("no institutional flow data — emitting no signals");
            return Ok(Artifact::Signals(Vec::new()));
        }

        let net: f64 = flows.iter().map(|f| f.net()).sum();
        // Net flows in crores; +/-1000 saturates the score.
        let score = ((net / 500.0).round() as i32).clamp(-2, 2) + if net > 0.0 { 1 } else { -1 };
        let score = score.clamp(Self::BOUNDS.min, Self::BOUNDS.max);
        let rationale = format!("institutional net flow {net:+.0}");

        let mut signals = Vec::new();
        for symbol in &ctx.config.universe {
            signals.push(StockSignal::new(
                symbol.clone(),
                self.id(),
                score,
                Self::BOUNDS,
                0.6,
                rationale.clone(),
                Utc::now(),
                ctx.produced_by(),
            )?);
        }
        Ok(Artifact::Signals(signals))
    }
}

// ---------------------------------------------------------------------------
// Options analyst
// ---------------------------------------------------------------------------

/// Reads derivatives positioning: put-call ratio as the hedging/sentiment
/// gauge and max pain as the pin the chain pulls toward.  Declared score
/// range: [-3, 3].  Symbols without a chain are skipped, never an error.
pub struct OptionsAnalyst;

impl OptionsAnalyst {
    pub const BOUNDS: ScoreBounds = ScoreBounds::new(-3, 3);
}

#[async_trait]
impl Analyst for OptionsAnalyst {
    fn id(&self) -> &str {
        "options"
    }

    async fn analyze(&self, ctx: &StageCtx) -> Result<Artifact> {
        let mut signals = Vec::new();

        for symbol in &ctx.config.universe {
            ctx.check_cancelled()?;
            let chain = match ctx.broker.get_option_chain(symbol, 10).await {
                Ok(c) => c,
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "no option chain — skipping symbol");
                    continue;
                }
            };
            let rows: Vec<StrikeRow> = chain
                .strikes
                .iter()
                .map(|s| StrikeRow {
                    strike: s.strike,
                    call_oi: s.call_oi,
                    put_oi: s.put_oi,
                    call_iv: s.call_iv,
                    put_iv: s.put_iv,
                })
                .collect();

            let Some(pcr) = put_call_ratio(&rows) else {
                continue;
            };

            let mut score = 0i32;
            let mut parts: Vec<String> = Vec::new();
            if pcr >= 1.3 {
                score += 2;
                parts.push(format!("PCR {pcr:.2} heavy put hedging"));
            } else if pcr <= 0.7 {
                score -= 2;
                parts.push(format!("PCR {pcr:.2} call-skewed"));
            } else {
                parts.push(format!("PCR {pcr:.2} balanced"));
            }

            if let Some(pin) = max_pain(&rows) {
                if chain.spot < pin {
                    score += 1;
                    parts.push(format!("max pain {pin:.0} above spot"));
                } else if chain.spot > pin {
                    score -= 1;
                    parts.push(format!("max pain {pin:.0} below spot"));
                }
            }

            signals.push(StockSignal::new(
                symbol.clone(),
                self.id(),
                score.clamp(Self::BOUNDS.min, Self::BOUNDS.max),
                Self::BOUNDS,
                0.55,
                parts.join(", "),
                Utc::now(),
                ctx.produced_by(),
            )?);
        }

        Ok(Artifact::Signals(signals))
    }
}

// ---------------------------------------------------------------------------
// News analyst
// ---------------------------------------------------------------------------

/// Condenses the news stream since the last digest into a NewsDigest.
pub struct NewsAnalyst;

#[async_trait]
impl Analyst for NewsAnalyst {
    fn id(&self) -> &str {
        "news"
    }

    async fn analyze(&self, ctx: &StageCtx) -> Result<Artifact> {
        ctx.check_cancelled()?;

        // Pick up where the previous digest of the day left off.
        let cutoff = ctx
            .state_get("digest")
            .and_then(|a| a.as_news().map(|d| d.produced_at))
            .unwrap_or_else(|| Utc::now() - ChronoDuration::hours(24));
        let items = ctx.market.news_since(cutoff).await;

        let mut risk_on = 0u32;
        let mut risk_off = 0u32;
        let mut key_events = Vec::new();
        let mut affected: Vec<String> = Vec::new();

        for item in &items {
            match item.sentiment_hint {
                Some(Sentiment::RiskOn) => risk_on += 1,
                Some(Sentiment::RiskOff) => risk_off += 1,
                _ => {}
            }
            key_events.push(KeyEvent {
                headline: item.headline.clone(),
                symbols: item.symbols.clone(),
                observed_at: item.published_at,
            });
            for sym in &item.symbols {
                if !affected.contains(sym) {
                    affected.push(sym.clone());
                }
            }
        }

        let sentiment = if risk_off > risk_on {
            Sentiment::RiskOff
        } else if risk_on > risk_off {
            Sentiment::RiskOn
        } else {
            Sentiment::Neutral
        };

        Ok(Artifact::News(NewsDigest {
            produced_at: Utc::now(),
            key_events,
            sentiment,
            affected_symbols: affected,
            produced_by: ctx.produced_by(),
        }))
    }
}
