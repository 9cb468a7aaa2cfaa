// =============================================================================
// Artifacts — typed records exchanged between workflow stages
// =============================================================================
//
// Every artifact validates on construction and fails early on violation: an
// invalid artifact is never produced, so downstream stages can trust what
// they read.  Each artifact carries a `produced_by` tag (workflow, stage,
// run_id) so the post-trade analyst can attribute decisions after the fact.
//
// The tagged `Artifact` enum is the value type of `session_state` and of
// every persisted step output.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Direction, EntryType, ProductType};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Validation failure raised by an artifact constructor.
#[derive(Debug, Error, PartialEq)]
pub enum ArtifactError {
    #[error("regime HALT requires position_multiplier 0, got {0}")]
    HaltWithExposure(f64),

    #[error("position_multiplier {0} outside [0, 1.5]")]
    MultiplierRange(f64),

    #[error("score {score} outside declared bounds [{min}, {max}] for analyst {analyst}")]
    ScoreBounds {
        analyst: String,
        score: i32,
        min: i32,
        max: i32,
    },

    #[error("confidence {0} outside [0, 1]")]
    ConfidenceRange(f64),

    #[error("candidate confidence {0} below emit threshold 0.70")]
    ConfidenceTooLow(f64),

    #[error("entry range inverted: low {low} > high {high}")]
    EntryRangeInverted { low: f64, high: f64 },

    #[error("{direction} candidate geometry violated: stop {stop_loss}, entry [{entry_low}, {entry_high}], target {take_profit}")]
    CandidateGeometry {
        direction: Direction,
        stop_loss: f64,
        entry_low: f64,
        entry_high: f64,
        take_profit: f64,
    },

    #[error("target distance {actual:.4} below minimum move {required:.4}")]
    TargetTooClose { actual: f64, required: f64 },

    #[error("quantity {0} must be >= 1")]
    ZeroQuantity(u32),

    #[error("quantity {quantity} is not a multiple of lot size {lot_size}")]
    LotMismatch { quantity: u32, lot_size: u32 },

    #[error("order risk {risk:.2} exceeds per-trade cap {cap:.2}")]
    RiskCapExceeded { risk: f64, cap: f64 },

    #[error("non-finite value in field {0}")]
    NonFinite(&'static str),
}

fn require_finite(value: f64, field: &'static str) -> Result<f64, ArtifactError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ArtifactError::NonFinite(field))
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Attribution tag attached to every artifact: which stage of which run of
/// which workflow produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedBy {
    pub workflow: String,
    pub stage: String,
    pub run_id: String,
}

impl ProducedBy {
    pub fn new(
        workflow: impl Into<String>,
        stage: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            stage: stage.into(),
            run_id: run_id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Regime
// ---------------------------------------------------------------------------

/// Coarse market state used as a gate and weight on analyst outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegimeState {
    Calm,
    Normal,
    Elevated,
    Halt,
}

impl std::fmt::Display for RegimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Calm => write!(f, "CALM"),
            Self::Normal => write!(f, "NORMAL"),
            Self::Elevated => write!(f, "ELEVATED"),
            Self::Halt => write!(f, "HALT"),
        }
    }
}

/// Market regime snapshot.  `Halt` forces the position multiplier to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regime {
    pub state: RegimeState,
    pub vix: f64,
    pub position_multiplier: f64,
    pub produced_by: ProducedBy,
}

impl Regime {
    pub fn new(
        state: RegimeState,
        vix: f64,
        position_multiplier: f64,
        produced_by: ProducedBy,
    ) -> Result<Self, ArtifactError> {
        let vix = require_finite(vix, "vix")?;
        let position_multiplier = require_finite(position_multiplier, "position_multiplier")?;

        if !(0.0..=1.5).contains(&position_multiplier) {
            return Err(ArtifactError::MultiplierRange(position_multiplier));
        }
        if state == RegimeState::Halt && position_multiplier != 0.0 {
            return Err(ArtifactError::HaltWithExposure(position_multiplier));
        }

        Ok(Self {
            state,
            vix,
            position_multiplier,
            produced_by,
        })
    }

    pub fn is_halt(&self) -> bool {
        self.state == RegimeState::Halt
    }
}

// ---------------------------------------------------------------------------
// StockSignal
// ---------------------------------------------------------------------------

/// Per-analyst score range, declared by the analyst and validated on ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBounds {
    pub min: i32,
    pub max: i32,
}

impl ScoreBounds {
    pub const fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }
}

/// A single analyst's view on one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockSignal {
    pub symbol: String,
    pub analyst_id: String,
    pub score: i32,
    pub bounds: ScoreBounds,
    pub confidence: f64,
    pub rationale: String,
    pub produced_at: DateTime<Utc>,
    pub produced_by: ProducedBy,
}

impl StockSignal {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        analyst_id: impl Into<String>,
        score: i32,
        bounds: ScoreBounds,
        confidence: f64,
        rationale: impl Into<String>,
        produced_at: DateTime<Utc>,
        produced_by: ProducedBy,
    ) -> Result<Self, ArtifactError> {
        let analyst_id = analyst_id.into();
        if score < bounds.min || score > bounds.max {
            return Err(ArtifactError::ScoreBounds {
                analyst: analyst_id,
                score,
                min: bounds.min,
                max: bounds.max,
            });
        }
        let confidence = require_finite(confidence, "confidence")?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ArtifactError::ConfidenceRange(confidence));
        }

        Ok(Self {
            symbol: symbol.into(),
            analyst_id,
            score,
            bounds,
            confidence,
            rationale: rationale.into(),
            produced_at,
            produced_by,
        })
    }

    /// Score normalised to [-1, 1] within the analyst's declared bounds.
    pub fn normalized_score(&self) -> f64 {
        let span = (self.bounds.max - self.bounds.min) as f64;
        if span == 0.0 {
            return 0.0;
        }
        let unit = (self.score - self.bounds.min) as f64 / span;
        unit * 2.0 - 1.0
    }
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// A stock pick with direction and explicit entry/SL/TP, eligible for risk
/// sizing. Minimum emit confidence is 0.70.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub composite_score: f64,
    pub confidence: f64,
    pub entry_low: f64,
    pub entry_high: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub contributing_signals: Vec<StockSignal>,
    pub produced_by: ProducedBy,
}

/// Minimum confidence a Candidate needs to be emitted.
pub const CANDIDATE_MIN_CONFIDENCE: f64 = 0.70;

impl Candidate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        candidate_id: impl Into<String>,
        symbol: impl Into<String>,
        direction: Direction,
        composite_score: f64,
        confidence: f64,
        entry_low: f64,
        entry_high: f64,
        stop_loss: f64,
        take_profit: f64,
        target_move_pct: f64,
        contributing_signals: Vec<StockSignal>,
        produced_by: ProducedBy,
    ) -> Result<Self, ArtifactError> {
        let composite_score = require_finite(composite_score, "composite_score")?;
        let confidence = require_finite(confidence, "confidence")?;
        let entry_low = require_finite(entry_low, "entry_low")?;
        let entry_high = require_finite(entry_high, "entry_high")?;
        let stop_loss = require_finite(stop_loss, "stop_loss")?;
        let take_profit = require_finite(take_profit, "take_profit")?;

        if !(0.0..=1.0).contains(&confidence) {
            return Err(ArtifactError::ConfidenceRange(confidence));
        }
        if confidence < CANDIDATE_MIN_CONFIDENCE {
            return Err(ArtifactError::ConfidenceTooLow(confidence));
        }
        if entry_low > entry_high {
            return Err(ArtifactError::EntryRangeInverted {
                low: entry_low,
                high: entry_high,
            });
        }

        let geometry_ok = match direction {
            Direction::Long => stop_loss < entry_low && take_profit > entry_high,
            Direction::Short => stop_loss > entry_high && take_profit < entry_low,
        };
        if !geometry_ok {
            return Err(ArtifactError::CandidateGeometry {
                direction,
                stop_loss,
                entry_low,
                entry_high,
                take_profit,
            });
        }

        let entry_mid = (entry_low + entry_high) / 2.0;
        let required = (target_move_pct / 100.0) * entry_mid;
        let actual = (take_profit - entry_mid).abs();
        if actual < required {
            return Err(ArtifactError::TargetTooClose { actual, required });
        }

        Ok(Self {
            candidate_id: candidate_id.into(),
            symbol: symbol.into(),
            direction,
            composite_score,
            confidence,
            entry_low,
            entry_high,
            stop_loss,
            take_profit,
            contributing_signals,
            produced_by,
        })
    }

    /// Midpoint of the entry range.
    pub fn entry_mid(&self) -> f64 {
        (self.entry_low + self.entry_high) / 2.0
    }

    /// Distance from entry midpoint to stop — the per-unit risk.
    pub fn stop_distance(&self) -> f64 {
        (self.entry_mid() - self.stop_loss).abs()
    }
}

// ---------------------------------------------------------------------------
// ApprovedOrder
// ---------------------------------------------------------------------------

/// A Candidate that has passed risk sizing and capital/margin checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovedOrder {
    pub candidate_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub quantity: u32,
    pub entry_type: EntryType,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub product_type: ProductType,
    pub tag: String,
    pub produced_by: ProducedBy,
}

impl ApprovedOrder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        candidate: &Candidate,
        quantity: u32,
        entry_type: EntryType,
        entry_price: f64,
        lot_size: u32,
        per_trade_risk: f64,
        tag: impl Into<String>,
        produced_by: ProducedBy,
    ) -> Result<Self, ArtifactError> {
        let entry_price = require_finite(entry_price, "entry_price")?;

        if quantity == 0 {
            return Err(ArtifactError::ZeroQuantity(quantity));
        }
        if lot_size > 0 && quantity % lot_size != 0 {
            return Err(ArtifactError::LotMismatch { quantity, lot_size });
        }

        let risk = quantity as f64 * (entry_price - candidate.stop_loss).abs();
        if risk > per_trade_risk {
            return Err(ArtifactError::RiskCapExceeded {
                risk,
                cap: per_trade_risk,
            });
        }

        Ok(Self {
            candidate_id: candidate.candidate_id.clone(),
            symbol: candidate.symbol.clone(),
            direction: candidate.direction,
            quantity,
            entry_type,
            entry_price,
            stop_loss: candidate.stop_loss,
            take_profit: candidate.take_profit,
            product_type: ProductType::Intraday,
            tag: tag.into(),
            produced_by,
        })
    }

    /// Worst-case rupee loss if the stop is hit at its current level.
    pub fn risk_at_stop(&self) -> f64 {
        self.quantity as f64 * (self.entry_price - self.stop_loss).abs()
    }
}

// ---------------------------------------------------------------------------
// NewsDigest
// ---------------------------------------------------------------------------

/// Aggregate news sentiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sentiment {
    RiskOn,
    Neutral,
    RiskOff,
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RiskOn => write!(f, "RISK_ON"),
            Self::Neutral => write!(f, "NEUTRAL"),
            Self::RiskOff => write!(f, "RISK_OFF"),
        }
    }
}

/// A single noteworthy market event inside a digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub headline: String,
    pub symbols: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

/// Rolling intraday news picture.  Digests are additive within a trading
/// day: merging never deletes facts from an earlier digest; the later
/// `produced_at` decides sentiment when digests disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsDigest {
    pub produced_at: DateTime<Utc>,
    pub key_events: Vec<KeyEvent>,
    pub sentiment: Sentiment,
    pub affected_symbols: Vec<String>,
    pub produced_by: ProducedBy,
}

impl NewsDigest {
    /// Merge `self` (the newer digest) on top of `prior` from the same
    /// trading day. Events from the prior digest are retained; duplicates
    /// (same headline) are kept once; affected symbols are unioned.
    pub fn merge(mut self, prior: &NewsDigest) -> NewsDigest {
        for event in &prior.key_events {
            if !self.key_events.iter().any(|e| e.headline == event.headline) {
                self.key_events.push(event.clone());
            }
        }
        for sym in &prior.affected_symbols {
            if !self.affected_symbols.contains(sym) {
                self.affected_symbols.push(sym.clone());
            }
        }
        // Later timestamp wins on sentiment; `self` is only authoritative if
        // it really is newer.
        if prior.produced_at > self.produced_at {
            self.sentiment = prior.sentiment;
            self.produced_at = prior.produced_at;
        }
        self
    }

    /// Whether this digest invalidates the thesis of a position in `symbol`
    /// with the given direction.
    pub fn invalidates(&self, symbol: &str, direction: Direction) -> bool {
        let affected = self.affected_symbols.iter().any(|s| s == symbol);
        match direction {
            Direction::Long => affected && self.sentiment == Sentiment::RiskOff,
            Direction::Short => affected && self.sentiment == Sentiment::RiskOn,
        }
    }
}

// ---------------------------------------------------------------------------
// DayReport
// ---------------------------------------------------------------------------

/// Prediction-accuracy roll-up for one analyst across the review window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalystAccuracy {
    pub analyst_id: String,
    pub signals: u32,
    pub correct: u32,
    pub accuracy: f64,
}

/// End-of-day self-evaluation written by the post-trade workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayReport {
    pub date: String,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub hit_rate: f64,
    pub analyst_accuracy: Vec<AnalystAccuracy>,
    pub lessons: Vec<String>,
    pub produced_by: ProducedBy,
}

// ---------------------------------------------------------------------------
// The tagged artifact enum
// ---------------------------------------------------------------------------

/// Value type of `session_state` entries and persisted step outputs.
///
/// `Null` is the output of a tolerated stage failure; `Halt` is the terminal
/// signal a gating function stage emits to short-circuit the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Artifact {
    Regime(Regime),
    Signals(Vec<StockSignal>),
    Candidates(Vec<Candidate>),
    ApprovedOrders(Vec<ApprovedOrder>),
    News(NewsDigest),
    Report(DayReport),
    Note(serde_json::Value),
    /// Output of a parallel group: member name -> member artifact.
    Group(BTreeMap<String, Artifact>),
    Halt { reason: String },
    Null,
}

impl Artifact {
    pub fn is_halt(&self) -> bool {
        matches!(self, Artifact::Halt { .. })
    }

    pub fn as_regime(&self) -> Option<&Regime> {
        match self {
            Artifact::Regime(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_signals(&self) -> Option<&[StockSignal]> {
        match self {
            Artifact::Signals(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_candidates(&self) -> Option<&[Candidate]> {
        match self {
            Artifact::Candidates(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_approved_orders(&self) -> Option<&[ApprovedOrder]> {
        match self {
            Artifact::ApprovedOrders(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_news(&self) -> Option<&NewsDigest> {
        match self {
            Artifact::News(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&BTreeMap<String, Artifact>> {
        match self {
            Artifact::Group(g) => Some(g),
            _ => None,
        }
    }
}

/// Shared mutable mapping visible to every stage in a run; persisted to the
/// session store at run end.  BTreeMap keeps serialization order stable so a
/// persisted snapshot reloads byte-for-byte.
pub type SessionState = BTreeMap<String, Artifact>;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tag() -> ProducedBy {
        ProducedBy::new("test", "stage", "run-1")
    }

    fn long_candidate() -> Candidate {
        Candidate::new(
            "c1",
            "NSE:RELIANCE-EQ",
            Direction::Long,
            0.8,
            0.8,
            100.0,
            100.2,
            99.0,
            101.2,
            1.0,
            Vec::new(),
            tag(),
        )
        .unwrap()
    }

    #[test]
    fn halt_regime_requires_zero_multiplier() {
        let err = Regime::new(RegimeState::Halt, 35.0, 0.5, tag()).unwrap_err();
        assert_eq!(err, ArtifactError::HaltWithExposure(0.5));

        let ok = Regime::new(RegimeState::Halt, 35.0, 0.0, tag()).unwrap();
        assert!(ok.is_halt());
    }

    #[test]
    fn multiplier_range_enforced() {
        assert!(Regime::new(RegimeState::Calm, 11.0, 1.5, tag()).is_ok());
        assert!(Regime::new(RegimeState::Calm, 11.0, 1.6, tag()).is_err());
        assert!(Regime::new(RegimeState::Calm, 11.0, -0.1, tag()).is_err());
    }

    #[test]
    fn signal_score_bounds_validated() {
        let bounds = ScoreBounds::new(-10, 10);
        let err = StockSignal::new(
            "NSE:INFY-EQ",
            "technical",
            11,
            bounds,
            0.9,
            "r",
            Utc::now(),
            tag(),
        )
        .unwrap_err();
        assert!(matches!(err, ArtifactError::ScoreBounds { .. }));
    }

    #[test]
    fn signal_score_normalization() {
        let bounds = ScoreBounds::new(-10, 10);
        let s = StockSignal::new(
            "NSE:INFY-EQ",
            "technical",
            10,
            bounds,
            0.9,
            "r",
            Utc::now(),
            tag(),
        )
        .unwrap();
        assert!((s.normalized_score() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn long_candidate_geometry() {
        // stop above entry low must be rejected
        let err = Candidate::new(
            "c1",
            "NSE:TCS-EQ",
            Direction::Long,
            0.8,
            0.8,
            100.0,
            100.2,
            100.1,
            101.2,
            1.0,
            Vec::new(),
            tag(),
        )
        .unwrap_err();
        assert!(matches!(err, ArtifactError::CandidateGeometry { .. }));
    }

    #[test]
    fn short_candidate_geometry_mirrored() {
        let ok = Candidate::new(
            "c2",
            "NSE:TCS-EQ",
            Direction::Short,
            -0.8,
            0.8,
            100.0,
            100.2,
            101.0,
            98.9,
            1.0,
            Vec::new(),
            tag(),
        );
        assert!(ok.is_ok());

        let err = Candidate::new(
            "c3",
            "NSE:TCS-EQ",
            Direction::Short,
            -0.8,
            0.8,
            100.0,
            100.2,
            99.0, // stop below entry on a short
            98.9,
            1.0,
            Vec::new(),
            tag(),
        )
        .unwrap_err();
        assert!(matches!(err, ArtifactError::CandidateGeometry { .. }));
    }

    #[test]
    fn candidate_confidence_floor() {
        let err = Candidate::new(
            "c4",
            "NSE:TCS-EQ",
            Direction::Long,
            0.8,
            0.69,
            100.0,
            100.2,
            99.0,
            101.2,
            1.0,
            Vec::new(),
            tag(),
        )
        .unwrap_err();
        assert_eq!(err, ArtifactError::ConfidenceTooLow(0.69));
    }

    #[test]
    fn candidate_target_move_floor() {
        // 1% of entry_mid (100.1) = 1.001 required; tp at 100.8 gives 0.7.
        let err = Candidate::new(
            "c5",
            "NSE:TCS-EQ",
            Direction::Long,
            0.8,
            0.8,
            100.0,
            100.2,
            99.0,
            100.8,
            1.0,
            Vec::new(),
            tag(),
        )
        .unwrap_err();
        assert!(matches!(err, ArtifactError::TargetTooClose { .. }));
    }

    #[test]
    fn approved_order_risk_cap() {
        let cand = long_candidate();
        // 500 x |100.1 - 99.0| = 550 > 500 cap.
        let err = ApprovedOrder::new(&cand, 500, EntryType::Limit, 100.1, 1, 500.0, "t", tag())
            .unwrap_err();
        assert!(matches!(err, ArtifactError::RiskCapExceeded { .. }));

        // 450 x 1.1 = 495 fits.
        let ok = ApprovedOrder::new(&cand, 450, EntryType::Limit, 100.1, 1, 500.0, "t", tag());
        assert!(ok.is_ok());
    }

    #[test]
    fn approved_order_lot_multiple() {
        let cand = long_candidate();
        let err = ApprovedOrder::new(&cand, 7, EntryType::Limit, 100.1, 5, 10_000.0, "t", tag())
            .unwrap_err();
        assert_eq!(
            err,
            ArtifactError::LotMismatch {
                quantity: 7,
                lot_size: 5
            }
        );
    }

    #[test]
    fn news_digest_merge_is_additive() {
        let earlier = NewsDigest {
            produced_at: Utc::now() - chrono::Duration::hours(1),
            key_events: vec![KeyEvent {
                headline: "RBI holds rates".to_string(),
                symbols: vec!["NSE:HDFCBANK-EQ".to_string()],
                observed_at: Utc::now() - chrono::Duration::hours(1),
            }],
            sentiment: Sentiment::Neutral,
            affected_symbols: vec!["NSE:HDFCBANK-EQ".to_string()],
            produced_by: tag(),
        };

        let later = NewsDigest {
            produced_at: Utc::now(),
            key_events: vec![KeyEvent {
                headline: "Weak global cues".to_string(),
                symbols: vec![],
                observed_at: Utc::now(),
            }],
            sentiment: Sentiment::RiskOff,
            affected_symbols: vec!["NSE:RELIANCE-EQ".to_string()],
            produced_by: tag(),
        };

        let merged = later.merge(&earlier);
        // Earlier facts survive.
        assert_eq!(merged.key_events.len(), 2);
        assert!(merged
            .affected_symbols
            .contains(&"NSE:HDFCBANK-EQ".to_string()));
        // Later sentiment wins.
        assert_eq!(merged.sentiment, Sentiment::RiskOff);
    }

    #[test]
    fn news_invalidation_direction_aware() {
        let digest = NewsDigest {
            produced_at: Utc::now(),
            key_events: vec![],
            sentiment: Sentiment::RiskOff,
            affected_symbols: vec!["NSE:SBIN-EQ".to_string()],
            produced_by: tag(),
        };
        assert!(digest.invalidates("NSE:SBIN-EQ", Direction::Long));
        assert!(!digest.invalidates("NSE:SBIN-EQ", Direction::Short));
        assert!(!digest.invalidates("NSE:TCS-EQ", Direction::Long));
    }

    #[test]
    fn artifact_serde_round_trip() {
        let artifact = Artifact::Candidates(vec![long_candidate()]);
        let json = serde_json::to_string(&artifact).unwrap();
        let back: Artifact = serde_json::from_str(&json).unwrap();
        assert_eq!(artifact, back);
    }
}
