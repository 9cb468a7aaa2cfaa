// =============================================================================
// Workflow Runtime — stages, context, and the contract between them
// =============================================================================
//
// A Workflow is a named ordered sequence of Stages.  A Stage is an Agent
// (pluggable analyst), a Parallel Group of agents, or a deterministic
// Function.  Every stage body receives the same `StageCtx`: the workflow
// input, prior step outputs, the shared mutable session_state, rolling run
// history, cross-workflow session reads, and the broker / market-data ports.
//
// Parallel group members get a read-only view of session_state; merging
// member outputs into state is the job of a later function stage.
// =============================================================================

pub mod engine;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::artifacts::{Artifact, ProducedBy, SessionState};
use crate::broker::BrokerPort;
use crate::config::RuntimeConfig;
use crate::market_data::MarketDataPort;
use crate::store::{SessionStore, StepOutput, WorkflowSession};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag.  Stages honour it at stage boundaries and
/// before port calls; in-flight broker calls are never torn down mid-wire
/// (idempotent client tags make the retry safe instead).
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Stage bodies
// ---------------------------------------------------------------------------

/// What a stage body hands back to the runtime.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// Normal output, recorded under the stage name.
    Artifact(Artifact),
    /// Terminal gate signal: skip the remaining stages, run status HALT.
    Halt { reason: String },
}

/// An external analyst invoked by an Agent stage.  The reasoning body is a
/// black box; only the artifact contract is fixed.
#[async_trait]
pub trait Analyst: Send + Sync {
    /// Stable identifier recorded in signal attribution.
    fn id(&self) -> &str;

    async fn analyze(&self, ctx: &StageCtx) -> Result<Artifact>;
}

/// A deterministic function stage (gating, aggregation, persistence).
#[async_trait]
pub trait StageFn: Send + Sync {
    async fn call(&self, ctx: &StageCtx) -> Result<StageOutcome>;
}

/// Success policy for a parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumPolicy {
    /// Every member must succeed.
    Strict,
    /// At least `n` members must succeed; failed members yield Null.
    AtLeast(usize),
}

/// The three stage shapes.
pub enum StageKind {
    Agent(Arc<dyn Analyst>),
    Parallel {
        members: Vec<(String, Arc<dyn Analyst>)>,
        policy: QuorumPolicy,
    },
    Function(Arc<dyn StageFn>),
}

/// One declared stage of a workflow.
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    /// A tolerant stage that fails yields a Null artifact and the run
    /// continues with status PARTIAL instead of FAILED.
    pub tolerant: bool,
}

impl Stage {
    pub fn agent(name: impl Into<String>, analyst: Arc<dyn Analyst>) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Agent(analyst),
            tolerant: false,
        }
    }

    pub fn parallel(
        name: impl Into<String>,
        members: Vec<(String, Arc<dyn Analyst>)>,
        policy: QuorumPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Parallel { members, policy },
            tolerant: false,
        }
    }

    pub fn function(name: impl Into<String>, f: Arc<dyn StageFn>) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Function(f),
            tolerant: false,
        }
    }

    pub fn tolerant(mut self) -> Self {
        self.tolerant = true;
        self
    }
}

/// A named ordered sequence of stages.
pub struct Workflow {
    pub name: String,
    pub stages: Vec<Stage>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage context
// ---------------------------------------------------------------------------

/// Everything a stage body may see and touch.
pub struct StageCtx {
    pub workflow: String,
    pub stage: String,
    pub run_id: String,
    /// Trading date (YYYY-MM-DD in the venue timezone).
    pub session_id: String,
    pub input: Value,

    pub broker: Arc<dyn BrokerPort>,
    pub market: Arc<dyn MarketDataPort>,
    pub config: Arc<RuntimeConfig>,

    steps: Arc<Vec<StepOutput>>,
    previous: Option<Artifact>,
    state: Arc<Mutex<SessionState>>,
    state_read_only: bool,
    store: Arc<SessionStore>,
    cancel: CancelFlag,
}

impl StageCtx {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        workflow: String,
        stage: String,
        run_id: String,
        session_id: String,
        input: Value,
        broker: Arc<dyn BrokerPort>,
        market: Arc<dyn MarketDataPort>,
        config: Arc<RuntimeConfig>,
        steps: Arc<Vec<StepOutput>>,
        previous: Option<Artifact>,
        state: Arc<Mutex<SessionState>>,
        state_read_only: bool,
        store: Arc<SessionStore>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            workflow,
            stage,
            run_id,
            session_id,
            input,
            broker,
            market,
            config,
            steps,
            previous,
            state,
            state_read_only,
            store,
            cancel,
        }
    }

    /// The immediately prior stage's output (a Group artifact after a
    /// parallel group).
    pub fn previous_step_content(&self) -> Option<&Artifact> {
        self.previous.as_ref()
    }

    /// Any prior named stage's output.  Top-level stage names win over
    /// members nested inside a parallel group's output.
    pub fn get_step_content(&self, name: &str) -> Option<Artifact> {
        if let Some(step) = self.steps.iter().find(|s| s.name == name) {
            return Some(step.artifact.clone());
        }
        for step in self.steps.iter() {
            if let Artifact::Group(members) = &step.artifact {
                if let Some(found) = members.get(name) {
                    return Some(found.clone());
                }
            }
        }
        None
    }

    /// Read one key of the shared session state.
    pub fn state_get(&self, key: &str) -> Option<Artifact> {
        self.state.lock().get(key).cloned()
    }

    /// Full snapshot of the shared session state.
    pub fn state_snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// Write one key of the shared session state.  Rejected inside parallel
    /// group members; merge member outputs in a later function stage.
    pub fn state_set(&self, key: impl Into<String>, artifact: Artifact) -> Result<()> {
        if self.state_read_only {
            bail!("session_state is read-only inside a parallel group member");
        }
        self.state.lock().insert(key.into(), artifact);
        Ok(())
    }

    /// The last `n` prior runs of this workflow as (input, output) pairs,
    /// oldest first.
    pub fn workflow_history(&self, n: usize) -> Vec<(Value, Option<Artifact>)> {
        self.history_of(&self.workflow, n)
    }

    /// Rolling run history of any workflow (read-only cross-workflow view).
    pub fn history_of(&self, workflow: &str, n: usize) -> Vec<(Value, Option<Artifact>)> {
        self.store
            .last_n_runs(workflow, n)
            .unwrap_or_default()
            .into_iter()
            .map(|r| (r.input, r.output))
            .collect()
    }

    /// Read-only handle on another workflow's session for the same (or any)
    /// trading date.  Only committed state is visible.
    pub fn cross_session(&self, workflow: &str, session_id: &str) -> Option<WorkflowSession> {
        self.store.load(workflow, session_id).ok().flatten()
    }

    /// Attribution tag for artifacts produced in this stage.
    pub fn produced_by(&self) -> ProducedBy {
        ProducedBy::new(self.workflow.clone(), self.stage.clone(), self.run_id.clone())
    }

    /// Cancellation check; stage bodies call this before port calls.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("run cancelled");
        }
        Ok(())
    }

    /// Clone this context for a parallel group member: same visibility,
    /// member-specific stage name, read-only state.
    pub(crate) fn for_member(&self, member: &str) -> Self {
        Self {
            workflow: self.workflow.clone(),
            stage: format!("{}.{}", self.stage, member),
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            input: self.input.clone(),
            broker: Arc::clone(&self.broker),
            market: Arc::clone(&self.market),
            config: Arc::clone(&self.config),
            steps: Arc::clone(&self.steps),
            previous: self.previous.clone(),
            state: Arc::clone(&self.state),
            state_read_only: true,
            store: Arc::clone(&self.store),
            cancel: self.cancel.clone(),
        }
    }
}
