// =============================================================================
// Application State — wiring for the Saffron orchestrator
// =============================================================================
//
// Builds and owns every subsystem: ports, stores, engines, scheduler.  All
// subsystems manage their own interior mutability; AppState ties them
// together behind `Arc` so the CLI, the scheduler, and the read-model API
// share one graph.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::auth::AuthManager;
use crate::broker::http::{HttpBroker, TokenCell};
use crate::broker::sim::SimBroker;
use crate::broker::BrokerPort;
use crate::config::RuntimeConfig;
use crate::execution::ExecutionEngine;
use crate::ledger::TradeLedger;
use crate::market_data::{MarketDataPort, StaticMarketData};
use crate::monitor::PositionMonitor;
use crate::scheduler::{standard_triggers, Clock, Scheduler, SystemClock, TradingCalendar};
use crate::store::SessionStore;
use crate::workflow::engine::WorkflowEngine;
use crate::workflows;

/// Environment variable holding the broker app secret (never in config).
const BROKER_SECRET_ENV: &str = "SAFFRON_BROKER_SECRET";

pub struct AppState {
    pub config: Arc<RuntimeConfig>,
    pub broker: Arc<dyn BrokerPort>,
    pub store: Arc<SessionStore>,
    pub ledger: Arc<TradeLedger>,
    pub audit: Arc<AuditLog>,
    pub auth: Option<Arc<AuthManager>>,
    pub execution: Arc<ExecutionEngine>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// Build the full subsystem graph from configuration.
    pub fn build(config: RuntimeConfig) -> Result<Arc<Self>> {
        let timezone: Tz = config
            .venue_timezone
            .parse()
            .with_context(|| format!("invalid venue timezone {}", config.venue_timezone))?;
        let config = Arc::new(config);

        let token_cell = Arc::new(TokenCell::new());
        let broker: Arc<dyn BrokerPort> = if config.paper_trading {
            info!("paper trading — simulated broker engaged");
            Arc::new(SimBroker::new())
        } else {
            let secret = std::env::var(BROKER_SECRET_ENV).unwrap_or_else(|_| {
                warn!("{BROKER_SECRET_ENV} not set — signed requests will be rejected");
                String::new()
            });
            let http = Arc::new(HttpBroker::new(
                config.broker_app_id.clone(),
                secret,
                config.broker_base_url.clone(),
                Arc::clone(&token_cell),
            ));
            http.spawn_order_feed();
            http
        };

        // Live auxiliary-data adapters plug in behind the same port; the
        // in-memory source keeps offline and paper runs self-contained.
        let market: Arc<dyn MarketDataPort> = Arc::new(StaticMarketData::new());

        let store = Arc::new(SessionStore::new(&config.sessions_dir));
        let ledger = Arc::new(TradeLedger::open(&config.ledger_dir)?);
        let audit = Arc::new(AuditLog::new(&config.audit_path));

        // The token ladder only gates live trading; the simulated broker
        // accepts every call.
        let auth = (!config.paper_trading).then(|| {
            Arc::new(AuthManager::new(
                Arc::clone(&broker),
                Arc::clone(&token_cell),
                config.token_path.clone(),
                &config.broker_base_url,
                config.broker_app_id.clone(),
            ))
        });

        let execution = Arc::new(ExecutionEngine::new(
            Arc::clone(&broker),
            Arc::clone(&ledger),
            Arc::clone(&audit),
            config.execution.clone(),
            auth.clone(),
        ));
        execution.spawn_update_pump();

        let monitor = Arc::new(PositionMonitor::new(
            Arc::clone(&broker),
            Arc::clone(&ledger),
            Arc::clone(&execution),
            Arc::clone(&config),
            Arc::clone(&audit),
        ));

        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            Arc::clone(&market),
            Arc::clone(&config),
            auth.clone(),
        ));

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let workflow_set = vec![
            Arc::new(workflows::intraday_analysis(Arc::clone(&ledger))),
            Arc::new(workflows::order_execution(Arc::clone(&execution))),
            Arc::new(workflows::position_monitoring(
                Arc::clone(&monitor),
                Arc::clone(&clock),
                timezone,
            )),
            Arc::new(workflows::news_digest()),
            Arc::new(workflows::post_trade_analysis(
                Arc::clone(&ledger),
                Arc::clone(&store),
            )),
        ];

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&engine),
            workflow_set,
            standard_triggers(),
            clock,
            TradingCalendar::from_strings(&config.holidays),
            timezone,
            Arc::clone(&audit),
            auth.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            broker,
            store,
            ledger,
            audit,
            auth,
            execution,
            scheduler,
        }))
    }
}
