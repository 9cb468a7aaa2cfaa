// =============================================================================
// Saffron Orchestrator — Main Entry Point
// =============================================================================
//
// Operator CLI plus the long-running engine.  Exit codes follow the operator
// contract:
//   login:         0 valid token, 2 interactive step required, 1 failure
//   run-workflow:  0 OK, 3 HALT, 1 FAILED
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analysts;
mod api;
mod app_state;
mod artifacts;
mod audit;
mod auth;
mod broker;
mod config;
mod execution;
mod indicators;
mod ledger;
mod market_data;
mod monitor;
mod risk;
mod scheduler;
mod store;
mod types;
mod workflow;
mod workflows;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::auth::AuthStatus;
use crate::config::RuntimeConfig;
use crate::execution::reconcile::reconcile_once;
use crate::store::RunStatus;

#[derive(Parser)]
#[command(name = "saffron", version, about = "Intraday equities workflow orchestrator")]
struct Cli {
    /// Path to the runtime configuration file.
    #[arg(long, default_value = "saffron.json")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the token ladder and report token health.
    Login,
    /// One-shot manual trigger of a workflow, obeying the non-overlap rule.
    RunWorkflow {
        /// Workflow name (e.g. intraday_analysis, position_monitoring).
        name: String,
        /// Trading date YYYY-MM-DD; defaults to today in the venue timezone.
        #[arg(long)]
        session: Option<String>,
    },
    /// Print one workflow session as JSON.
    ShowSession { workflow: String, date: String },
    /// Run the full engine: scheduler, order feed, read-model API.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = RuntimeConfig::load(&cli.config).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    let app = AppState::build(config)?;

    match cli.command {
        Command::Login => {
            let code = login(&app).await;
            std::process::exit(code);
        }
        Command::RunWorkflow { name, session } => {
            let code = run_workflow(&app, &name, session).await;
            std::process::exit(code);
        }
        Command::ShowSession { workflow, date } => match app.store.load(&workflow, &date)? {
            Some(session) => {
                println!("{}", serde_json::to_string_pretty(&session)?);
            }
            None => {
                error!(workflow = %workflow, date = %date, "no such session");
                std::process::exit(1);
            }
        },
        Command::Serve => serve(app).await?,
    }

    Ok(())
}

async fn login(app: &Arc<AppState>) -> i32 {
    let Some(auth) = &app.auth else {
        info!("paper trading — no broker token required");
        return 0;
    };
    match auth.ensure_valid().await {
        AuthStatus::Valid => {
            info!("token valid");
            0
        }
        AuthStatus::NeedsInteractive => {
            warn!("interactive login required — complete the broker auth flow and save the token");
            2
        }
        AuthStatus::Failed(msg) => {
            error!(error = %msg, "token ladder failed");
            1
        }
    }
}

async fn run_workflow(app: &Arc<AppState>, name: &str, session: Option<String>) -> i32 {
    match app.scheduler.run_once(name, session).await {
        Ok(run) => {
            info!(run_id = %run.run_id, status = %run.status, "manual run finished");
            match run.status {
                RunStatus::Ok | RunStatus::Partial => 0,
                RunStatus::Halt => 3,
                RunStatus::Failed => 1,
            }
        }
        Err(e) => {
            error!(error = %e, "manual run failed to start");
            1
        }
    }
}

async fn serve(app: Arc<AppState>) -> anyhow::Result<()> {
    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Saffron Orchestrator — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!(
        universe = app.config.universe.len(),
        paper_trading = app.config.paper_trading,
        timezone = %app.config.venue_timezone,
        "engine configuration"
    );

    // Gate startup on a valid token; paper mode has no ladder.
    if app.auth.is_some() {
        let code = login(&app).await;
        if code != 0 {
            anyhow::bail!("token not valid (login exit code {code}) — run `saffron login`");
        }
    }

    // Reconcile the ledger against broker truth before the first trigger.
    let session_id = app.scheduler.session_id();
    match reconcile_once(&app.broker, &app.ledger, &app.execution, &app.audit, &session_id).await
    {
        Ok(result) if result.corrections > 0 => {
            warn!(corrections = result.corrections, "startup reconciliation corrected drift");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "startup reconciliation failed — continuing"),
    }

    let scheduler = Arc::clone(&app.scheduler);
    let scheduler_task = tokio::spawn(async move { scheduler.run_forever().await });

    let api_task = tokio::spawn(api::serve(Arc::clone(&app)));

    tokio::select! {
        _ = scheduler_task => error!("scheduler loop exited"),
        result = api_task => {
            if let Ok(Err(e)) = result {
                error!(error = %e, "read-model API exited");
            }
        }
    }
    Ok(())
}
