// =============================================================================
// Session Store — durable per-workflow-per-session record of runs and state
// =============================================================================
//
// Key: (workflow_name, session_id), where session_id is the trading date
// (YYYY-MM-DD) in the venue's timezone.  Value: the ordered run list plus the
// latest session_state.  Runs are append-only; session_state is replaced
// wholesale at run end (safe because the scheduler allows one in-flight run
// per workflow).
//
// One JSON file per key, written with the atomic tmp + rename pattern, so a
// crash mid-run leaves the previously persisted state intact.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::artifacts::{Artifact, SessionState};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Terminal status of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// All stages completed.
    Ok,
    /// A stage failed; the remainder was skipped.
    Failed,
    /// Completed, but one or more tolerant stages were skipped.
    Partial,
    /// A gating stage short-circuited the run.
    Halt,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Failed => write!(f, "FAILED"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Halt => write!(f, "HALT"),
        }
    }
}

/// One named stage output, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub name: String,
    pub artifact: Artifact,
}

/// One invocation of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub input: Value,
    pub output: Option<Artifact>,
    pub step_outputs: Vec<StepOutput>,
    pub state_snapshot: SessionState,
    pub status: RunStatus,
}

impl WorkflowRun {
    /// Named step output; the first match in declaration order wins.
    pub fn step(&self, name: &str) -> Option<&Artifact> {
        self.step_outputs
            .iter()
            .find(|s| s.name == name)
            .map(|s| &s.artifact)
    }
}

/// The persistent record for one trading date of one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub workflow_name: String,
    pub session_id: String,
    pub runs: Vec<WorkflowRun>,
    pub session_state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// File-backed session store with per-key write locks.
pub struct SessionStore {
    dir: PathBuf,
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn key_path(&self, workflow: &str, session_id: &str) -> PathBuf {
        self.dir.join(format!("{workflow}__{session_id}.json"))
    }

    fn lock_for(&self, workflow: &str, session_id: &str) -> Arc<Mutex<()>> {
        let key = format!("{workflow}__{session_id}");
        Arc::clone(
            self.write_locks
                .lock()
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Load one session; `None` when it has never been written.
    pub fn load(&self, workflow: &str, session_id: &str) -> Result<Option<WorkflowSession>> {
        let path = self.key_path(workflow, session_id);
        read_session(&path)
    }

    /// Append a run atomically together with the resulting session_state.
    /// Opening a session is implicit on the first run.
    pub fn append_run(
        &self,
        workflow: &str,
        session_id: &str,
        run: WorkflowRun,
        session_state: SessionState,
    ) -> Result<WorkflowSession> {
        if run.ended_at < run.started_at {
            bail!(
                "run {} ends before it starts ({} < {})",
                run.run_id,
                run.ended_at,
                run.started_at
            );
        }

        let lock = self.lock_for(workflow, session_id);
        let _guard = lock.lock();

        let path = self.key_path(workflow, session_id);
        let now = Utc::now();

        let mut session = read_session(&path)?.unwrap_or_else(|| WorkflowSession {
            workflow_name: workflow.to_string(),
            session_id: session_id.to_string(),
            runs: Vec::new(),
            session_state: SessionState::new(),
            created_at: now,
            updated_at: now,
        });

        if let Some(last) = session.runs.last() {
            if run.started_at < last.started_at {
                bail!(
                    "run {} starts before the previously appended run ({} < {})",
                    run.run_id,
                    run.started_at,
                    last.started_at
                );
            }
        }

        debug!(
            workflow,
            session_id,
            run_id = %run.run_id,
            status = %run.status,
            "appending run"
        );

        session.runs.push(run);
        session.session_state = session_state;
        session.updated_at = now;

        write_session(&path, &session)?;
        Ok(session)
    }

    /// The last `n` runs of `workflow` across all of its sessions, ordered
    /// chronologically (oldest of the window first).
    pub fn last_n_runs(&self, workflow: &str, n: usize) -> Result<Vec<WorkflowRun>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut runs: Vec<WorkflowRun> = Vec::new();
        for session in self.all_sessions(workflow)? {
            runs.extend(session.runs);
        }
        runs.sort_by_key(|r| r.started_at);
        let skip = runs.len().saturating_sub(n);
        Ok(runs.split_off(skip))
    }

    /// Sessions of `workflow` with `from <= session_id <= to` (dates compare
    /// lexicographically in YYYY-MM-DD form), ordered by session_id.
    pub fn sessions_between(
        &self,
        workflow: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<WorkflowSession>> {
        let mut sessions: Vec<WorkflowSession> = self
            .all_sessions(workflow)?
            .into_iter()
            .filter(|s| s.session_id.as_str() >= from && s.session_id.as_str() <= to)
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    fn all_sessions(&self, workflow: &str) -> Result<Vec<WorkflowSession>> {
        let mut sessions = Vec::new();
        if !self.dir.exists() {
            return Ok(sessions);
        }
        let prefix = format!("{workflow}__");
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(".json") {
                if let Some(session) = read_session(&entry.path())? {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }
}

fn read_session(path: &Path) -> Result<Option<WorkflowSession>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read session {}", path.display()))?;
    let session = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse session {}", path.display()))?;
    Ok(Some(session))
}

fn write_session(path: &Path, session: &WorkflowSession) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(session).context("failed to serialise session")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &content)
        .with_context(|| format!("failed to write tmp session to {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename tmp session to {}", path.display()))?;
    info!(path = %path.display(), runs = session.runs.len(), "session persisted");
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(id: &str, offset_secs: i64, status: RunStatus) -> WorkflowRun {
        let started = Utc::now() + chrono::Duration::seconds(offset_secs);
        WorkflowRun {
            run_id: id.to_string(),
            started_at: started,
            ended_at: started + chrono::Duration::seconds(10),
            input: json!("daily"),
            output: Some(Artifact::Null),
            step_outputs: vec![StepOutput {
                name: "noop".to_string(),
                artifact: Artifact::Null,
            }],
            state_snapshot: SessionState::new(),
            status,
        }
    }

    #[test]
    fn append_creates_session_implicitly() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let session = store
            .append_run("intraday_analysis", "2026-07-30", run("r1", 0, RunStatus::Ok), SessionState::new())
            .unwrap();

        assert_eq!(session.runs.len(), 1);
        assert_eq!(session.workflow_name, "intraday_analysis");
        assert!(store.load("intraday_analysis", "2026-07-30").unwrap().is_some());
    }

    #[test]
    fn runs_are_append_only_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store
            .append_run("wf", "2026-07-30", run("r1", 0, RunStatus::Ok), SessionState::new())
            .unwrap();
        let session = store
            .append_run("wf", "2026-07-30", run("r2", 60, RunStatus::Failed), SessionState::new())
            .unwrap();

        assert_eq!(session.runs.len(), 2);
        assert!(session.runs[0].started_at <= session.runs[1].started_at);
        for r in &session.runs {
            assert!(r.started_at <= r.ended_at);
        }

        // A run that starts before the last appended one is rejected.
        assert!(store
            .append_run("wf", "2026-07-30", run("r0", -600, RunStatus::Ok), SessionState::new())
            .is_err());
    }

    #[test]
    fn inverted_run_times_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let mut bad = run("r1", 0, RunStatus::Ok);
        bad.ended_at = bad.started_at - chrono::Duration::seconds(1);
        assert!(store
            .append_run("wf", "2026-07-30", bad, SessionState::new())
            .is_err());
    }

    #[test]
    fn session_state_reloads_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let mut state = SessionState::new();
        state.insert("note".to_string(), Artifact::Note(json!({"k": [1, 2, 3]})));
        state.insert("halt".to_string(), Artifact::Halt { reason: "vix".to_string() });

        store
            .append_run("wf", "2026-07-30", run("r1", 0, RunStatus::Ok), state.clone())
            .unwrap();

        let first = std::fs::read_to_string(dir.path().join("wf__2026-07-30.json")).unwrap();
        let loaded = store.load("wf", "2026-07-30").unwrap().unwrap();
        assert_eq!(loaded.session_state, state);

        // Re-serialising the loaded session reproduces the file exactly.
        let again = serde_json::to_string_pretty(&loaded).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn last_n_runs_spans_sessions_chronologically() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store
            .append_run("wf", "2026-07-28", run("d1", -200, RunStatus::Ok), SessionState::new())
            .unwrap();
        store
            .append_run("wf", "2026-07-29", run("d2", -100, RunStatus::Ok), SessionState::new())
            .unwrap();
        store
            .append_run("wf", "2026-07-30", run("d3", 0, RunStatus::Ok), SessionState::new())
            .unwrap();

        let last_two = store.last_n_runs("wf", 2).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].run_id, "d2");
        assert_eq!(last_two[1].run_id, "d3");

        // Asking for more than exists returns everything, oldest first.
        let all = store.last_n_runs("wf", 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].run_id, "d1");
    }

    #[test]
    fn sessions_between_filters_by_date() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        for (date, offset) in [("2026-07-25", -300), ("2026-07-28", -200), ("2026-07-30", 0)] {
            store
                .append_run("wf", date, run(date, offset, RunStatus::Ok), SessionState::new())
                .unwrap();
        }

        let mid = store.sessions_between("wf", "2026-07-26", "2026-07-30").unwrap();
        assert_eq!(mid.len(), 2);
        assert_eq!(mid[0].session_id, "2026-07-28");
        assert_eq!(mid[1].session_id, "2026-07-30");
    }

    #[test]
    fn cross_workflow_reads_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store
            .append_run("news_digest", "2026-07-30", run("n1", 0, RunStatus::Ok), SessionState::new())
            .unwrap();

        assert!(store.load("intraday_analysis", "2026-07-30").unwrap().is_none());
        assert!(store.load("news_digest", "2026-07-30").unwrap().is_some());
    }
}
