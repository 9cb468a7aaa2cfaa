// =============================================================================
// Workflow Engine — executes stages in order and persists the run
// =============================================================================
//
// Execution semantics:
//   - Stages run sequentially in declaration order; a Parallel Group runs
//     its members concurrently on a fan-out bounded by the group size.
//   - On stage failure the run is FAILED and the remainder skipped, unless
//     the stage is tolerant (Null artifact, run ends PARTIAL).
//   - A gating function stage may emit HALT, which short-circuits the rest.
//   - Every stage runs under a deadline; expiry fails the run, no retry.
//   - AUTH_EXPIRED surfacing from a port pauses the run, drives the token
//     ladder once, and retries the stage once.
//   - The run (with its final session_state snapshot, even after a failure)
//     is always appended to the session store.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifacts::{Artifact, SessionState};
use crate::auth::{AuthManager, AuthStatus};
use crate::broker::{BrokerError, BrokerPort};
use crate::config::RuntimeConfig;
use crate::market_data::MarketDataPort;
use crate::store::{RunStatus, SessionStore, StepOutput, WorkflowRun};
use crate::workflow::{
    Analyst, CancelFlag, QuorumPolicy, Stage, StageCtx, StageKind, StageOutcome, Workflow,
};

/// Executes workflows against the session store and the ports.
pub struct WorkflowEngine {
    store: Arc<SessionStore>,
    broker: Arc<dyn BrokerPort>,
    market: Arc<dyn MarketDataPort>,
    config: Arc<RuntimeConfig>,
    auth: Option<Arc<AuthManager>>,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<SessionStore>,
        broker: Arc<dyn BrokerPort>,
        market: Arc<dyn MarketDataPort>,
        config: Arc<RuntimeConfig>,
        auth: Option<Arc<AuthManager>>,
    ) -> Self {
        Self {
            store,
            broker,
            market,
            config,
            auth,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Execute one run of `workflow` for `session_id` and persist it.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        session_id: &str,
        input: Value,
        cancel: CancelFlag,
    ) -> Result<WorkflowRun> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        info!(
            workflow = %workflow.name,
            session_id,
            run_id = %run_id,
            "workflow run started"
        );

        // Session state is read before the first stage; intermediate writes
        // are visible to later stages immediately.
        let initial_state = self
            .store
            .load(&workflow.name, session_id)?
            .map(|s| s.session_state)
            .unwrap_or_default();
        let state = Arc::new(Mutex::new(initial_state));

        let mut steps: Vec<StepOutput> = Vec::new();
        let mut previous: Option<Artifact> = None;
        let mut status = RunStatus::Ok;
        let mut any_tolerated = false;
        let deadline = Duration::from_secs(self.config.stage_deadline_secs);

        for stage in &workflow.stages {
            if cancel.is_cancelled() {
                warn!(workflow = %workflow.name, stage = %stage.name, "run cancelled before stage");
                status = RunStatus::Failed;
                break;
            }

            let ctx = StageCtx::new(
                workflow.name.clone(),
                stage.name.clone(),
                run_id.clone(),
                session_id.to_string(),
                input.clone(),
                Arc::clone(&self.broker),
                Arc::clone(&self.market),
                Arc::clone(&self.config),
                Arc::new(steps.clone()),
                previous.clone(),
                Arc::clone(&state),
                false,
                Arc::clone(&self.store),
                cancel.clone(),
            );

            match self.run_stage_with_auth_retry(stage, &ctx, deadline).await {
                Ok(StageOutcome::Artifact(artifact)) => {
                    previous = Some(artifact.clone());
                    steps.push(StepOutput {
                        name: stage.name.clone(),
                        artifact,
                    });
                }
                Ok(StageOutcome::Halt { reason }) => {
                    info!(workflow = %workflow.name, stage = %stage.name, reason = %reason, "run halted by gate");
                    let halt = Artifact::Halt { reason };
                    previous = Some(halt.clone());
                    steps.push(StepOutput {
                        name: stage.name.clone(),
                        artifact: halt,
                    });
                    status = RunStatus::Halt;
                    break;
                }
                Err(e) if stage.tolerant => {
                    warn!(
                        workflow = %workflow.name,
                        stage = %stage.name,
                        error = %e,
                        "tolerant stage failed — continuing with null artifact"
                    );
                    any_tolerated = true;
                    previous = Some(Artifact::Null);
                    steps.push(StepOutput {
                        name: stage.name.clone(),
                        artifact: Artifact::Null,
                    });
                }
                Err(e) => {
                    error!(
                        workflow = %workflow.name,
                        stage = %stage.name,
                        error = %e,
                        "stage failed — skipping remaining stages"
                    );
                    status = RunStatus::Failed;
                    break;
                }
            }
        }

        if status == RunStatus::Ok && any_tolerated {
            status = RunStatus::Partial;
        }

        let snapshot: SessionState = state.lock().clone();
        let run = WorkflowRun {
            run_id: run_id.clone(),
            started_at,
            ended_at: Utc::now(),
            input,
            output: steps.last().map(|s| s.artifact.clone()),
            step_outputs: steps,
            state_snapshot: snapshot.clone(),
            status,
        };

        self.store
            .append_run(&workflow.name, session_id, run.clone(), snapshot)?;

        info!(
            workflow = %workflow.name,
            run_id = %run_id,
            status = %status,
            stages = run.step_outputs.len(),
            "workflow run persisted"
        );
        Ok(run)
    }

    /// Run a stage under its deadline; on AUTH_EXPIRED, drive the token
    /// ladder once and retry the stage once.
    async fn run_stage_with_auth_retry(
        &self,
        stage: &Stage,
        ctx: &StageCtx,
        deadline: Duration,
    ) -> Result<StageOutcome> {
        let first = self.run_stage_with_deadline(stage, ctx, deadline).await;
        let Err(e) = &first else {
            return first;
        };

        let auth_expired = e
            .downcast_ref::<BrokerError>()
            .map(|b| matches!(b, BrokerError::AuthExpired))
            .unwrap_or(false);
        if !auth_expired {
            return first;
        }

        let Some(auth) = &self.auth else {
            return first;
        };

        warn!(stage = %stage.name, "auth expired mid-stage — running token ladder");
        match auth.ensure_valid().await {
            AuthStatus::Valid => self.run_stage_with_deadline(stage, ctx, deadline).await,
            other => Err(anyhow!("token ladder did not recover: {other:?}")),
        }
    }

    async fn run_stage_with_deadline(
        &self,
        stage: &Stage,
        ctx: &StageCtx,
        deadline: Duration,
    ) -> Result<StageOutcome> {
        match tokio::time::timeout(deadline, self.run_stage(stage, ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow!(
                "stage {} exceeded its {}s deadline",
                stage.name,
                deadline.as_secs()
            )),
        }
    }

    async fn run_stage(&self, stage: &Stage, ctx: &StageCtx) -> Result<StageOutcome> {
        ctx.check_cancelled()?;
        match &stage.kind {
            StageKind::Agent(analyst) => {
                let artifact = analyst.analyze(ctx).await?;
                Ok(StageOutcome::Artifact(artifact))
            }
            StageKind::Function(f) => f.call(ctx).await,
            StageKind::Parallel { members, policy } => {
                self.run_parallel(members, *policy, ctx).await
            }
        }
    }

    /// Run group members concurrently.  The fan-out is naturally bounded by
    /// the group size; members see a read-only session_state and no other
    /// member's output.
    async fn run_parallel(
        &self,
        members: &[(String, Arc<dyn Analyst>)],
        policy: QuorumPolicy,
        ctx: &StageCtx,
    ) -> Result<StageOutcome> {
        let mut set = JoinSet::new();
        for (name, analyst) in members {
            let member_ctx = ctx.for_member(name);
            let analyst = Arc::clone(analyst);
            let name = name.clone();
            set.spawn(async move {
                let result = analyst.analyze(&member_ctx).await;
                (name, result)
            });
        }

        let mut outputs = std::collections::BTreeMap::new();
        let mut failures: Vec<(String, String)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (name, result) = joined.map_err(|e| anyhow!("group member panicked: {e}"))?;
            match result {
                Ok(artifact) => {
                    outputs.insert(name, artifact);
                }
                Err(e) => {
                    warn!(member = %name, error = %e, "group member failed");
                    failures.push((name, e.to_string()));
                }
            }
        }

        match policy {
            QuorumPolicy::Strict if !failures.is_empty() => {
                let (name, err) = &failures[0];
                Err(anyhow!("group member {name} failed: {err}"))
            }
            QuorumPolicy::AtLeast(n) if outputs.len() < n => Err(anyhow!(
                "quorum not met: {} of {} members succeeded (need {n})",
                outputs.len(),
                outputs.len() + failures.len()
            )),
            _ => {
                // Failed members under a satisfied quorum yield Null.
                for (name, _) in failures {
                    outputs.insert(name, Artifact::Null);
                }
                Ok(StageOutcome::Artifact(Artifact::Group(outputs)))
            }
        }
    }
}
