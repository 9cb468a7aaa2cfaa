// =============================================================================
// Token Lifecycle — load, probe, refresh, re-auth
// =============================================================================
//
// Three-step ladder executed at process start and on AUTH_EXPIRED:
//
//   1. Load the saved token and probe it with a lightweight broker call
//      (`get_profile`).  A token counts as valid only when a probe succeeded
//      recently; the local expiry check alone is insufficient.
//   2. If the probe fails and refresh material exists, run the broker's
//      refresh flow.  The flow demands the trading PIN, which must be present
//      in the environment; without it the ladder surfaces the interactive
//      requirement instead of guessing.
//   3. Otherwise report that the operator must re-authenticate out of band.
//
// Refresh is serialized behind a mutex so concurrent observers of
// AUTH_EXPIRED cooperate on one refresh instead of racing.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::broker::http::TokenCell;
use crate::broker::BrokerPort;

/// Clock-skew margin subtracted from the stored expiry, in minutes.
const EXPIRY_SKEW_MINS: i64 = 5;

/// How recent (minutes) the last successful profile probe must be for the
/// token to be considered live without re-probing.
const PROBE_FRESHNESS_MINS: i64 = 15;

/// Environment variable holding the interactive trading PIN.
const PIN_ENV: &str = "SAFFRON_PIN";

// ---------------------------------------------------------------------------
// Stored token
// ---------------------------------------------------------------------------

/// Persisted auth material plus probe bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub app_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub last_probe_at: Option<DateTime<Utc>>,
}

impl StoredToken {
    /// Local expiry check with skew margin.  Necessary but not sufficient.
    pub fn locally_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - chrono::Duration::minutes(EXPIRY_SKEW_MINS)
    }

    fn probe_fresh(&self, now: DateTime<Utc>) -> bool {
        self.last_probe_at
            .map(|t| now - t < chrono::Duration::minutes(PROBE_FRESHNESS_MINS))
            .unwrap_or(false)
    }
}

/// Load a token file, returning `None` when the file does not exist.
pub fn load_token(path: &Path) -> Result<Option<StoredToken>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read token file {}", path.display()))?;
    let token = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse token file {}", path.display()))?;
    Ok(Some(token))
}

/// Persist the token atomically (tmp + rename).
pub fn save_token(path: &Path, token: &StoredToken) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(token).context("failed to serialise token")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &content)
        .with_context(|| format!("failed to write tmp token to {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename tmp token to {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Ladder outcome
// ---------------------------------------------------------------------------

/// Result of running the token ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    /// Token probed successfully; workflow dispatch may proceed.
    Valid,
    /// Refresh requires an interactive step (PIN / fresh login) the
    /// orchestrator cannot perform on its own.
    NeedsInteractive,
    /// Permanent failure (refresh rejected, upstream hard error).
    Failed(String),
}

// ---------------------------------------------------------------------------
// Auth manager
// ---------------------------------------------------------------------------

/// Owns the token file, the shared access-token cell, and the refresh flow.
pub struct AuthManager {
    broker: Arc<dyn BrokerPort>,
    token_cell: Arc<TokenCell>,
    token_path: PathBuf,
    refresh_url: String,
    app_id: String,
    http: reqwest::Client,
    /// Serializes the ladder so concurrent AUTH_EXPIRED observers cooperate.
    ladder_lock: Mutex<()>,
}

impl AuthManager {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        token_cell: Arc<TokenCell>,
        token_path: impl Into<PathBuf>,
        broker_base_url: &str,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            token_cell,
            token_path: token_path.into(),
            refresh_url: format!("{broker_base_url}/api/token/refresh"),
            app_id: app_id.into(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            ladder_lock: Mutex::new(()),
        }
    }

    /// Run the three-step ladder.  Safe to call from multiple tasks; only
    /// one ladder runs at a time and late arrivals see its outcome.
    pub async fn ensure_valid(&self) -> AuthStatus {
        let _guard = self.ladder_lock.lock().await;
        let now = Utc::now();

        // Step 1: saved token + probe.
        let mut token = match load_token(&self.token_path) {
            Ok(Some(t)) => t,
            Ok(None) => {
                warn!("no saved token — interactive login required");
                self.token_cell.clear();
                return AuthStatus::NeedsInteractive;
            }
            Err(e) => {
                self.token_cell.clear();
                return AuthStatus::Failed(format!("token load failed: {e:#}"));
            }
        };

        if token.locally_fresh(now) {
            self.token_cell.set(token.access.clone());
            if token.probe_fresh(now) || self.probe(&mut token).await {
                return AuthStatus::Valid;
            }
        }

        // Step 2: refresh flow.
        if token.refresh.is_some() {
            match self.refresh(&token).await {
                RefreshOutcome::Refreshed(mut fresh) => {
                    self.token_cell.set(fresh.access.clone());
                    if self.probe(&mut fresh).await {
                        info!("token refreshed and probed");
                        return AuthStatus::Valid;
                    }
                    return AuthStatus::Failed("refreshed token failed probe".to_string());
                }
                RefreshOutcome::NeedsInteractive => return AuthStatus::NeedsInteractive,
                RefreshOutcome::Failed(msg) => return AuthStatus::Failed(msg),
            }
        }

        // Step 3: out of options.
        warn!("token expired and no refresh material — interactive login required");
        AuthStatus::NeedsInteractive
    }

    /// Probe the broker with `get_profile`; on success stamp and persist the
    /// probe time.
    async fn probe(&self, token: &mut StoredToken) -> bool {
        match self.broker.get_profile().await {
            Ok(profile) => {
                token.last_probe_at = Some(Utc::now());
                token.user_id = Some(profile.user_id.clone());
                if let Err(e) = save_token(&self.token_path, token) {
                    warn!(error = %e, "failed to persist probe timestamp");
                }
                info!(user_id = %profile.user_id, "profile probe succeeded");
                true
            }
            Err(e) => {
                warn!(error = %e, "profile probe failed");
                false
            }
        }
    }

    async fn refresh(&self, token: &StoredToken) -> RefreshOutcome {
        let Ok(pin) = std::env::var(PIN_ENV) else {
            warn!("refresh flow requires {PIN_ENV} — deferring to operator");
            return RefreshOutcome::NeedsInteractive;
        };
        let Some(refresh) = token.refresh.as_deref() else {
            return RefreshOutcome::NeedsInteractive;
        };

        let body = json!({
            "app_id": self.app_id,
            "refresh_token": refresh,
            "pin": pin,
        });

        let resp = match self.http.post(&self.refresh_url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return RefreshOutcome::Failed(format!("refresh request failed: {e}")),
        };
        if !resp.status().is_success() {
            return RefreshOutcome::Failed(format!("refresh rejected: HTTP {}", resp.status()));
        }
        let payload: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => return RefreshOutcome::Failed(format!("bad refresh payload: {e}")),
        };

        let Some(access) = payload["access_token"].as_str() else {
            return RefreshOutcome::Failed("refresh payload missing access_token".to_string());
        };
        let expires_in = payload["expires_in"].as_i64().unwrap_or(8 * 3600);

        let fresh = StoredToken {
            access: access.to_string(),
            refresh: payload["refresh_token"]
                .as_str()
                .map(str::to_string)
                .or_else(|| token.refresh.clone()),
            acquired_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
            app_id: token.app_id.clone(),
            user_id: token.user_id.clone(),
            last_probe_at: None,
        };
        if let Err(e) = save_token(&self.token_path, &fresh) {
            return RefreshOutcome::Failed(format!("failed to persist refreshed token: {e:#}"));
        }
        RefreshOutcome::Refreshed(fresh)
    }
}

enum RefreshOutcome {
    Refreshed(StoredToken),
    NeedsInteractive,
    Failed(String),
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::sim::SimBroker;
    use crate::broker::BrokerError;

    fn token(expires_in_mins: i64, probed: bool) -> StoredToken {
        StoredToken {
            access: "acc".to_string(),
            refresh: Some("ref".to_string()),
            acquired_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(expires_in_mins),
            app_id: "APP".to_string(),
            user_id: None,
            last_probe_at: probed.then(Utc::now),
        }
    }

    fn manager(dir: &tempfile::TempDir, broker: Arc<SimBroker>) -> AuthManager {
        AuthManager::new(
            broker,
            Arc::new(TokenCell::new()),
            dir.path().join("token.json"),
            "https://api.broker.invalid",
            "APP",
        )
    }

    #[test]
    fn local_freshness_includes_skew() {
        let t = token(4, false); // expires in 4 min < 5 min skew
        assert!(!t.locally_fresh(Utc::now()));
        let t = token(60, false);
        assert!(t.locally_fresh(Utc::now()));
    }

    #[test]
    fn token_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let t = token(60, true);
        save_token(&path, &t).unwrap();
        let loaded = load_token(&path).unwrap().unwrap();
        assert_eq!(loaded.access, t.access);
        assert_eq!(loaded.refresh, t.refresh);
    }

    #[test]
    fn missing_token_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_token(&dir.path().join("nope.json")).unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_token_needs_interactive() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir, Arc::new(SimBroker::new()));
        assert_eq!(mgr.ensure_valid().await, AuthStatus::NeedsInteractive);
    }

    #[tokio::test]
    async fn fresh_token_with_good_probe_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(SimBroker::new());
        let mgr = manager(&dir, Arc::clone(&broker));
        save_token(&dir.path().join("token.json"), &token(60, false)).unwrap();

        assert_eq!(mgr.ensure_valid().await, AuthStatus::Valid);
        // Probe timestamp must have been persisted.
        let stored = load_token(&dir.path().join("token.json")).unwrap().unwrap();
        assert!(stored.last_probe_at.is_some());
    }

    #[tokio::test]
    async fn failed_probe_without_pin_defers_to_operator() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Arc::new(SimBroker::new());
        broker.fail_next(BrokerError::AuthExpired);
        let mgr = manager(&dir, Arc::clone(&broker));
        save_token(&dir.path().join("token.json"), &token(60, false)).unwrap();

        std::env::remove_var(PIN_ENV);
        assert_eq!(mgr.ensure_valid().await, AuthStatus::NeedsInteractive);
    }
}
