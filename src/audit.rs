// =============================================================================
// Audit Trail — append-only JSONL plus an in-memory ring for the read-model
// =============================================================================
//
// Everything the operator will later ask "why did that happen?" about lands
// here: dropped and missed scheduler triggers, reconciliation corrections,
// forced closes, floor-guard tightenings, token ladder outcomes.
// =============================================================================

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// Maximum events retained in memory for the read-model.
const RING_CAPACITY: usize = 200;

/// Category of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditKind {
    SchedulerDrop,
    SchedulerMiss,
    ReconcileCorrection,
    ForcedClose,
    FloorGuard,
    TokenLadder,
    TradeCorrection,
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SchedulerDrop => write!(f, "SCHEDULER_DROP"),
            Self::SchedulerMiss => write!(f, "SCHEDULER_MISS"),
            Self::ReconcileCorrection => write!(f, "RECONCILE_CORRECTION"),
            Self::ForcedClose => write!(f, "FORCED_CLOSE"),
            Self::FloorGuard => write!(f, "FLOOR_GUARD"),
            Self::TokenLadder => write!(f, "TOKEN_LADDER"),
            Self::TradeCorrection => write!(f, "TRADE_CORRECTION"),
        }
    }
}

/// One audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

/// Append-only audit log.  Writes go to a JSONL file; the most recent events
/// are mirrored in memory.
pub struct AuditLog {
    path: PathBuf,
    ring: Mutex<VecDeque<AuditEvent>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
        }
    }

    /// Record one event.  File-write failures are logged and swallowed; the
    /// audit trail must never take the orchestrator down.
    pub fn record(&self, kind: AuditKind, message: impl Into<String>, details: Value) {
        let event = AuditEvent {
            at: Utc::now(),
            kind,
            message: message.into(),
            details,
        };

        info!(kind = %event.kind, message = %event.message, "audit event");

        {
            let mut ring = self.ring.lock();
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        if let Err(e) = self.append_line(&event) {
            warn!(error = %e, "failed to append audit event to file");
        }
    }

    /// Recent events, oldest first.
    pub fn recent(&self) -> Vec<AuditEvent> {
        self.ring.lock().iter().cloned().collect()
    }

    fn append_line(&self, event: &AuditEvent) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
