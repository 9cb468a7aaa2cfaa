// =============================================================================
// Scheduler — wall-clock trigger of the five workflows on a market-hours cron
// =============================================================================
//
// Rules:
//   - No catch-up: a trigger minute that passes while the process is down
//     (or busy) is recorded as missed, never replayed.
//   - Non-overlap per workflow: one in-flight run; an overlapping trigger
//     is dropped with an audit event.
//   - Holiday/weekend skip via the injectable trading calendar.
//   - All trigger times are venue-local; the clock is injectable so tests
//     drive a virtual clock.
//   - Every dispatch is gated on a valid token.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono::Datelike;
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{AuditKind, AuditLog};
use crate::auth::{AuthManager, AuthStatus};
use crate::store::WorkflowRun;
use crate::workflow::engine::WorkflowEngine;
use crate::workflow::{CancelFlag, Workflow};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Injectable time source; the scheduler never reads the system clock
/// directly.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Production clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
pub struct VirtualClock {
    now: Mutex<DateTime<Utc>>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }

    pub fn advance_minutes(&self, minutes: i64) {
        let mut now = self.now.lock();
        *now += chrono::Duration::minutes(minutes);
    }
}

impl Clock for VirtualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ---------------------------------------------------------------------------
// Calendar
// ---------------------------------------------------------------------------

/// Weekend plus exchange-holiday gate.
#[derive(Debug, Clone, Default)]
pub struct TradingCalendar {
    holidays: HashSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    /// Parse YYYY-MM-DD holiday strings, ignoring malformed entries.
    pub fn from_strings(holidays: &[String]) -> Self {
        Self::new(
            holidays
                .iter()
                .filter_map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
        )
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// When a workflow fires, in venue-local wall-clock minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerRule {
    /// Once a day at the given time.
    DailyAt(NaiveTime),
    /// Every `every_mins` minutes from `start` to `end` inclusive.
    Every {
        start: NaiveTime,
        end: NaiveTime,
        every_mins: u32,
    },
}

impl TriggerRule {
    /// Does this rule fire at exactly `t` (seconds ignored)?
    pub fn fires_at(&self, t: NaiveTime) -> bool {
        let minute_of_day = |t: NaiveTime| t.hour() * 60 + t.minute();
        match *self {
            TriggerRule::DailyAt(at) => minute_of_day(t) == minute_of_day(at),
            TriggerRule::Every {
                start,
                end,
                every_mins,
            } => {
                let m = minute_of_day(t);
                let s = minute_of_day(start);
                let e = minute_of_day(end);
                every_mins > 0 && m >= s && m <= e && (m - s) % every_mins == 0
            }
        }
    }
}

/// One row of the trigger table.
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    pub workflow: String,
    pub rule: TriggerRule,
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).expect("valid trigger time")
}

/// The market-hours trigger table.
pub fn standard_triggers() -> Vec<TriggerSpec> {
    vec![
        TriggerSpec {
            workflow: crate::workflows::INTRADAY_ANALYSIS.to_string(),
            rule: TriggerRule::DailyAt(t(9, 0)),
        },
        TriggerSpec {
            workflow: crate::workflows::ORDER_EXECUTION.to_string(),
            rule: TriggerRule::DailyAt(t(9, 15)),
        },
        TriggerSpec {
            workflow: crate::workflows::POSITION_MONITORING.to_string(),
            rule: TriggerRule::Every {
                start: t(9, 30),
                end: t(15, 20),
                every_mins: 20,
            },
        },
        TriggerSpec {
            workflow: crate::workflows::NEWS_DIGEST.to_string(),
            rule: TriggerRule::Every {
                start: t(9, 0),
                end: t(16, 0),
                every_mins: 60,
            },
        },
        TriggerSpec {
            workflow: crate::workflows::POST_TRADE_ANALYSIS.to_string(),
            rule: TriggerRule::DailyAt(t(16, 0)),
        },
    ]
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Outcome of offering one trigger to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Started,
    /// A run of the same workflow is still in flight.
    Dropped,
    /// Token invalid or workflow unknown.
    Skipped(String),
}

pub struct Scheduler {
    engine: Arc<WorkflowEngine>,
    workflows: HashMap<String, Arc<Workflow>>,
    triggers: Vec<TriggerSpec>,
    clock: Arc<dyn Clock>,
    calendar: TradingCalendar,
    timezone: Tz,
    audit: Arc<AuditLog>,
    auth: Option<Arc<AuthManager>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    last_minute: Mutex<Option<DateTime<Utc>>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<WorkflowEngine>,
        workflows: Vec<Arc<Workflow>>,
        triggers: Vec<TriggerSpec>,
        clock: Arc<dyn Clock>,
        calendar: TradingCalendar,
        timezone: Tz,
        audit: Arc<AuditLog>,
        auth: Option<Arc<AuthManager>>,
    ) -> Self {
        Self {
            engine,
            workflows: workflows
                .into_iter()
                .map(|w| (w.name.clone(), w))
                .collect(),
            triggers,
            clock,
            calendar,
            timezone,
            audit,
            auth,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            last_minute: Mutex::new(None),
        }
    }

    /// Evaluate the current minute: record misses for skipped minutes (no
    /// replay) and dispatch every trigger due now.
    pub async fn tick(&self) -> Vec<(String, Dispatch)> {
        let now_utc = self.clock.now_utc();
        let minute = now_utc.with_second(0).and_then(|t| t.with_nanosecond(0));
        let Some(minute) = minute else {
            return Vec::new();
        };

        // Detect and record skipped minutes without replaying them.
        {
            let mut last = self.last_minute.lock();
            if let Some(prev) = *last {
                let gap = (minute - prev).num_minutes();
                if gap > 1 {
                    self.record_misses(prev, minute);
                }
            }
            *last = Some(minute);
        }

        let local = now_utc.with_timezone(&self.timezone);
        if !self.calendar.is_trading_day(local.date_naive()) {
            debug!(date = %local.date_naive(), "not a trading day — no triggers");
            return Vec::new();
        }

        let local_time = local.time();
        let due: Vec<String> = self
            .triggers
            .iter()
            .filter(|spec| spec.rule.fires_at(local_time))
            .map(|spec| spec.workflow.clone())
            .collect();

        let mut results = Vec::with_capacity(due.len());
        for workflow in due {
            let dispatch = self.dispatch(&workflow, None).await;
            results.push((workflow, dispatch));
        }
        results
    }

    /// Record triggers that fell into the (prev, now) gap as missed.
    fn record_misses(&self, prev: DateTime<Utc>, now: DateTime<Utc>) {
        let mut cursor = prev + chrono::Duration::minutes(1);
        let mut missed: Vec<String> = Vec::new();
        while cursor < now {
            let local = cursor.with_timezone(&self.timezone);
            if self.calendar.is_trading_day(local.date_naive()) {
                for spec in &self.triggers {
                    if spec.rule.fires_at(local.time()) {
                        missed.push(format!("{} at {}", spec.workflow, local.time()));
                    }
                }
            }
            cursor += chrono::Duration::minutes(1);
        }
        if !missed.is_empty() {
            warn!(count = missed.len(), "trigger minutes missed — not replayed");
            self.audit.record(
                AuditKind::SchedulerMiss,
                format!("{} trigger(s) missed, not replayed", missed.len()),
                json!({ "missed": missed }),
            );
        }
    }

    /// Offer one workflow trigger.  Enforces the non-overlap rule and the
    /// token gate, then spawns the run.
    pub async fn dispatch(&self, workflow_name: &str, session_override: Option<String>) -> Dispatch {
        let Some(workflow) = self.workflows.get(workflow_name) else {
            return Dispatch::Skipped(format!("unknown workflow {workflow_name}"));
        };

        if let Some(auth) = &self.auth {
            let status = auth.ensure_valid().await;
            if status != AuthStatus::Valid {
                self.audit.record(
                    AuditKind::TokenLadder,
                    format!("dispatch of {workflow_name} blocked: {status:?}"),
                    json!({}),
                );
                return Dispatch::Skipped(format!("token not valid: {status:?}"));
            }
        }

        // Non-overlap: claim the slot before spawning.
        {
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(workflow_name.to_string()) {
                warn!(workflow = workflow_name, "trigger dropped — run still in flight");
                self.audit.record(
                    AuditKind::SchedulerDrop,
                    format!("overlapping trigger for {workflow_name} dropped"),
                    json!({}),
                );
                return Dispatch::Dropped;
            }
        }

        let session_id = session_override.unwrap_or_else(|| self.session_id());
        let input = json!({
            "trigger": "scheduled",
            "fired_at": self.clock.now_utc().to_rfc3339(),
        });

        let engine = Arc::clone(&self.engine);
        let workflow = Arc::clone(workflow);
        let in_flight = Arc::clone(&self.in_flight);
        let name = workflow_name.to_string();

        info!(workflow = %name, session_id = %session_id, "dispatching run");
        tokio::spawn(async move {
            let result = engine
                .execute(&workflow, &session_id, input, CancelFlag::new())
                .await;
            if let Err(e) = result {
                warn!(workflow = %name, error = %e, "scheduled run errored");
            }
            in_flight.lock().remove(&name);
        });

        Dispatch::Started
    }

    /// One-shot manual trigger (operator CLI), obeying the non-overlap rule
    /// but running inline so the caller sees the run result.
    pub async fn run_once(
        &self,
        workflow_name: &str,
        session_override: Option<String>,
    ) -> Result<WorkflowRun> {
        let workflow = self
            .workflows
            .get(workflow_name)
            .ok_or_else(|| anyhow!("unknown workflow {workflow_name}"))?;

        {
            let mut in_flight = self.in_flight.lock();
            if !in_flight.insert(workflow_name.to_string()) {
                return Err(anyhow!("a run of {workflow_name} is already in flight"));
            }
        }

        let session_id = session_override.unwrap_or_else(|| self.session_id());
        let input = json!({ "trigger": "manual" });

        let result = self
            .engine
            .execute(workflow, &session_id, input, CancelFlag::new())
            .await;
        self.in_flight.lock().remove(workflow_name);
        result
    }

    /// Trading date in the venue timezone (the session id).
    pub fn session_id(&self) -> String {
        self.clock
            .now_utc()
            .with_timezone(&self.timezone)
            .date_naive()
            .format("%Y-%m-%d")
            .to_string()
    }

    pub fn is_in_flight(&self, workflow_name: &str) -> bool {
        self.in_flight.lock().contains(workflow_name)
    }

    /// Minute loop for production: tick, then sleep to the next minute
    /// boundary.  Runs until the process exits.
    pub async fn run_forever(&self) {
        info!(triggers = self.triggers.len(), "scheduler started");
        loop {
            self.tick().await;
            let now = self.clock.now_utc();
            let next_minute = (now + chrono::Duration::minutes(1))
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(now + chrono::Duration::minutes(1));
            let sleep_for = (next_minute - now)
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(60));
            tokio::time::sleep(sleep_for).await;
        }
    }
}
