// =============================================================================
// Runtime Configuration — Hot-reloadable orchestrator settings with atomic save
// =============================================================================
//
// Central configuration hub for the Saffron orchestrator.  Every tunable
// parameter lives here so that risk figures are injected, never hard-coded:
// the documented example numbers (100k capital, 500 per-trade risk, 1% target
// move) are serde defaults only.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_capital() -> f64 {
    100_000.0
}

fn default_per_trade_risk() -> f64 {
    500.0
}

fn default_daily_loss_floor() -> f64 {
    2_500.0
}

fn default_target_move_pct() -> f64 {
    1.0
}

fn default_sector_cap() -> u32 {
    2
}

fn default_max_open_trades() -> u32 {
    5
}

fn default_trail_trigger_r() -> f64 {
    1.0
}

fn default_trail_atr_mult() -> f64 {
    2.0
}

fn default_partial_trigger_r() -> f64 {
    2.0
}

fn default_partial_fraction() -> f64 {
    0.5
}

fn default_close_tighten_time() -> String {
    "14:45".to_string()
}

fn default_flatten_time() -> String {
    "15:15".to_string()
}

fn default_tighten_atr_fraction() -> f64 {
    0.75
}

fn default_entry_wait_secs() -> u64 {
    30
}

fn default_limit_offset_bps() -> f64 {
    5.0
}

fn default_high_liquidity_volume() -> f64 {
    500_000.0
}

fn default_stage_deadline_secs() -> u64 {
    300
}

fn default_history_depth() -> usize {
    5
}

fn default_venue_timezone() -> String {
    "Asia/Kolkata".to_string()
}

fn default_universe() -> Vec<String> {
    vec![
        "NSE:RELIANCE-EQ".to_string(),
        "NSE:HDFCBANK-EQ".to_string(),
        "NSE:INFY-EQ".to_string(),
        "NSE:TCS-EQ".to_string(),
        "NSE:ICICIBANK-EQ".to_string(),
    ]
}

fn default_sessions_dir() -> String {
    "data/sessions".to_string()
}

fn default_ledger_dir() -> String {
    "data/ledger".to_string()
}

fn default_token_path() -> String {
    "data/token.json".to_string()
}

fn default_audit_path() -> String {
    "data/audit.jsonl".to_string()
}

fn default_broker_base_url() -> String {
    "https://api.broker.invalid".to_string()
}

fn default_api_bind() -> String {
    "127.0.0.1:8090".to_string()
}

// =============================================================================
// RiskParams
// =============================================================================

/// Capital and exposure limits. All monetary figures are in the account
/// currency (INR for NSE).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    /// Starting capital for the session.
    #[serde(default = "default_capital")]
    pub capital: f64,

    /// Maximum rupee loss a single trade may risk (quantity x stop distance).
    #[serde(default = "default_per_trade_risk")]
    pub per_trade_risk: f64,

    /// Session-wide cumulative loss boundary. Realized + unrealized P&L must
    /// never breach -daily_loss_floor.
    #[serde(default = "default_daily_loss_floor")]
    pub daily_loss_floor: f64,

    /// Minimum take-profit distance as a percentage of entry price.
    #[serde(default = "default_target_move_pct")]
    pub target_move_pct: f64,

    /// Maximum simultaneous positions per sector.
    #[serde(default = "default_sector_cap")]
    pub sector_cap: u32,

    /// Maximum concurrent open trades across the book.
    #[serde(default = "default_max_open_trades")]
    pub max_open_trades: u32,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            capital: default_capital(),
            per_trade_risk: default_per_trade_risk(),
            daily_loss_floor: default_daily_loss_floor(),
            target_move_pct: default_target_move_pct(),
            sector_cap: default_sector_cap(),
            max_open_trades: default_max_open_trades(),
        }
    }
}

// =============================================================================
// MonitorParams
// =============================================================================

/// Tunables for the position-monitoring control loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorParams {
    /// R-multiple at which the trailing stop activates.
    #[serde(default = "default_trail_trigger_r")]
    pub trail_trigger_r: f64,

    /// ATR multiplier for the trailing stop distance. Clamped to [1.5, 2.0]
    /// at use sites.
    #[serde(default = "default_trail_atr_mult")]
    pub trail_atr_mult: f64,

    /// R-multiple at which part of the position is booked.
    #[serde(default = "default_partial_trigger_r")]
    pub partial_trigger_r: f64,

    /// Fraction of the position booked at the partial trigger (rounded to
    /// integer lot steps).
    #[serde(default = "default_partial_fraction")]
    pub partial_fraction: f64,

    /// Venue-local HH:MM after which all stops tighten.
    #[serde(default = "default_close_tighten_time")]
    pub close_tighten_time: String,

    /// Venue-local HH:MM after which every position is flattened.
    #[serde(default = "default_flatten_time")]
    pub flatten_time: String,

    /// Stop distance after `close_tighten_time`, as a fraction of ATR.
    #[serde(default = "default_tighten_atr_fraction")]
    pub tighten_atr_fraction: f64,
}

impl Default for MonitorParams {
    fn default() -> Self {
        Self {
            trail_trigger_r: default_trail_trigger_r(),
            trail_atr_mult: default_trail_atr_mult(),
            partial_trigger_r: default_partial_trigger_r(),
            partial_fraction: default_partial_fraction(),
            close_tighten_time: default_close_tighten_time(),
            flatten_time: default_flatten_time(),
            tighten_atr_fraction: default_tighten_atr_fraction(),
        }
    }
}

// =============================================================================
// ExecutionParams
// =============================================================================

/// Tunables for the order-execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionParams {
    /// Seconds to wait for the entry order to fill before cancelling the
    /// unfilled remainder.
    #[serde(default = "default_entry_wait_secs")]
    pub entry_wait_secs: u64,

    /// Minimum filled fraction required to proceed on a partial fill.
    /// 0.0 means any non-zero fill proceeds.
    #[serde(default)]
    pub min_fill_ratio: f64,

    /// Limit price offset in basis points for low-liquidity entries.
    #[serde(default = "default_limit_offset_bps")]
    pub limit_offset_bps: f64,

    /// Daily traded volume above which a symbol counts as high-liquidity
    /// (eligible for MARKET entries).
    #[serde(default = "default_high_liquidity_volume")]
    pub high_liquidity_volume: f64,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            entry_wait_secs: default_entry_wait_secs(),
            min_fill_ratio: 0.0,
            limit_offset_bps: default_limit_offset_bps(),
            high_liquidity_volume: default_high_liquidity_volume(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Saffron orchestrator.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Universe ------------------------------------------------------------

    /// Exchange-qualified symbols the orchestrator analyses and trades.
    #[serde(default = "default_universe")]
    pub universe: Vec<String>,

    /// Lot size per symbol. Symbols absent from the map trade in lots of 1.
    #[serde(default)]
    pub lot_sizes: HashMap<String, u32>,

    /// Sector label per symbol, used for the sector exposure cap.
    #[serde(default)]
    pub sectors: HashMap<String, String>,

    // --- Venue ---------------------------------------------------------------

    /// IANA timezone of the venue; all scheduling happens in this zone.
    #[serde(default = "default_venue_timezone")]
    pub venue_timezone: String,

    /// Exchange holidays as YYYY-MM-DD strings (weekends are implicit).
    #[serde(default)]
    pub holidays: Vec<String>,

    // --- Risk / monitor / execution -----------------------------------------

    #[serde(default)]
    pub risk: RiskParams,

    #[serde(default)]
    pub monitor: MonitorParams,

    #[serde(default)]
    pub execution: ExecutionParams,

    // --- Workflow runtime ----------------------------------------------------

    /// Per-stage deadline in seconds; expiry fails the run.
    #[serde(default = "default_stage_deadline_secs")]
    pub stage_deadline_secs: u64,

    /// How many prior runs `workflow_history` loads by default.
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,

    // --- Stores --------------------------------------------------------------

    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: String,

    #[serde(default = "default_ledger_dir")]
    pub ledger_dir: String,

    #[serde(default = "default_token_path")]
    pub token_path: String,

    #[serde(default = "default_audit_path")]
    pub audit_path: String,

    // --- Broker / API --------------------------------------------------------

    /// Base URL of the broker REST API.
    #[serde(default = "default_broker_base_url")]
    pub broker_base_url: String,

    /// Broker application id (the key half of the credential pair; the
    /// secret comes from the environment, never from this file).
    #[serde(default)]
    pub broker_app_id: String,

    /// Run against the simulated broker instead of the live adapter.
    #[serde(default)]
    pub paper_trading: bool,

    /// Bind address for the read-model API.
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            universe: default_universe(),
            lot_sizes: HashMap::new(),
            sectors: HashMap::new(),
            venue_timezone: default_venue_timezone(),
            holidays: Vec::new(),
            risk: RiskParams::default(),
            monitor: MonitorParams::default(),
            execution: ExecutionParams::default(),
            stage_deadline_secs: default_stage_deadline_secs(),
            history_depth: default_history_depth(),
            sessions_dir: default_sessions_dir(),
            ledger_dir: default_ledger_dir(),
            token_path: default_token_path(),
            audit_path: default_audit_path(),
            broker_base_url: default_broker_base_url(),
            broker_app_id: String::new(),
            paper_trading: false,
            api_bind: default_api_bind(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            universe = config.universe.len(),
            paper_trading = config.paper_trading,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides: symbol universe and broker credentials.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("SAFFRON_UNIVERSE") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.universe = parsed;
            }
        }
        if let Ok(app_id) = std::env::var("SAFFRON_BROKER_APP_ID") {
            if !app_id.is_empty() {
                self.broker_app_id = app_id;
            }
        }
    }

    /// Lot size for `symbol`, defaulting to 1 for unmapped symbols.
    pub fn lot_size(&self, symbol: &str) -> u32 {
        self.lot_sizes.get(symbol).copied().unwrap_or(1).max(1)
    }

    /// Sector label for `symbol`, defaulting to "UNMAPPED".
    pub fn sector(&self, symbol: &str) -> String {
        self.sectors
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| "UNMAPPED".to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.risk.capital > 0.0);
        assert!(cfg.risk.per_trade_risk > 0.0);
        assert!(cfg.risk.daily_loss_floor >= cfg.risk.per_trade_risk);
        assert!(!cfg.universe.is_empty());
        assert_eq!(cfg.lot_size("NSE:UNKNOWN-EQ"), 1);
    }

    #[test]
    fn empty_json_loads_all_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.risk.per_trade_risk, 500.0);
        assert_eq!(cfg.monitor.trail_trigger_r, 1.0);
        assert_eq!(cfg.venue_timezone, "Asia/Kolkata");
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.risk.per_trade_risk = 750.0;
        cfg.universe = vec!["NSE:SBIN-EQ".to_string()];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.risk.per_trade_risk, 750.0);
        assert_eq!(loaded.universe, vec!["NSE:SBIN-EQ".to_string()]);
    }

    #[test]
    fn partial_file_fills_missing_fields() {
        let json = r#"{"risk": {"per_trade_risk": 250.0}}"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.risk.per_trade_risk, 250.0);
        // Untouched fields fall back to defaults.
        assert_eq!(cfg.risk.capital, 100_000.0);
        assert_eq!(cfg.execution.entry_wait_secs, 30);
    }
}
