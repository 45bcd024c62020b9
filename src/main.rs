//! Decision Orchestrator - Main Entry Point
//!
//! Loads configuration, wires hooks, idempotency, workers and the paper
//! executor together, then runs decision cycles until shutdown.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use decision_orchestrator::config::load_config;
use decision_orchestrator::hooks::register_policy_hooks;
use decision_orchestrator::{
    AppConfig, CycleScheduler, DecisionWorker, ExecutionMode, HookRegistry, HttpDecisionWorker,
    IdempotencyGuard, IdempotencyStore, IdempotencySweepTask, IdleWorker, InMemoryPersistence,
    InMemoryStore, JsonFileStore, PaperExecutor, Persistence, RateLimitTracker, ResilientCaller,
    Shutdown,
};

/// CLI arguments for the application
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level or filter directive; overrides the config file
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// Stop after this many cycles
    #[arg(long)]
    max_cycles: Option<u64>,

    /// Run a single cycle and exit
    #[arg(long, conflicts_with = "max_cycles")]
    once: bool,

    /// Starting balance for every domain in paper mode
    #[arg(long, default_value = "10000")]
    paper_balance: Decimal,
}

fn init_logging(filter: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

fn build_idempotency(config: &AppConfig) -> Result<Arc<IdempotencyGuard>> {
    let store: Arc<dyn IdempotencyStore> = match &config.idempotency.store_path {
        Some(path) => Arc::new(
            JsonFileStore::open(path)
                .with_context(|| format!("opening idempotency store {}", path))?,
        ),
        None => Arc::new(InMemoryStore::new()),
    };
    let guard = IdempotencyGuard::from_config(&config.idempotency, store);
    let restored = guard.restore().context("restoring idempotency records")?;
    if restored > 0 {
        info!(restored, "Loaded idempotency records from previous run");
    }
    Ok(Arc::new(guard))
}

fn build_worker(config: &AppConfig, shutdown: &Shutdown) -> Result<Arc<dyn DecisionWorker>> {
    let Some(backend) = &config.backend else {
        warn!("No decision backend configured; every domain will idle");
        return Ok(Arc::new(IdleWorker));
    };

    let caller = ResilientCaller::new(config.retry.clone()).with_shutdown(shutdown.clone());
    let worker = HttpDecisionWorker::new("decision-backend", backend, caller, config.fallback.clone())?
        .with_rate_limits(Arc::new(RateLimitTracker::new(config.rate_limit.clone())));
    info!(
        endpoint = %worker.endpoint(),
        models = ?backend.models,
        "Using remote decision backend"
    );
    Ok(Arc::new(worker))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = load_config(Some(&args.config)).context("loading configuration")?;

    let filter = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.settings.log_level.clone());
    init_logging(&filter, args.log_json || config.settings.log_json)?;

    info!("Starting decision orchestrator");
    info!("Configuration file: {}", args.config);

    if config.scheduler.execution_mode == ExecutionMode::Live {
        bail!("live execution needs an external executor; the built-in executor only supports paper mode");
    }

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    let mut persistence = InMemoryPersistence::new();
    for domain in &config.scheduler.domains {
        persistence = persistence.with_balance(domain.clone(), args.paper_balance);
    }
    let persistence: Arc<dyn Persistence> = Arc::new(persistence);

    let hooks = Arc::new(HookRegistry::from_config(&config.hooks));
    let registered = register_policy_hooks(
        &hooks,
        &config.policy,
        persistence.clone(),
        &config.scheduler.domains,
    );
    info!(hooks = registered, names = ?hooks.names(), "Registered policy hooks");

    let guard = build_idempotency(&config)?;
    let worker = build_worker(&config, &shutdown)?;

    let scheduler = CycleScheduler::builder(config.scheduler.clone())
        .default_worker(worker)
        .executor(Arc::new(PaperExecutor::new(persistence.clone())))
        .persistence(persistence)
        .hooks(hooks)
        .idempotency(guard.clone())
        .maintenance_task(Arc::new(IdempotencySweepTask::new(
            guard,
            config.idempotency.sweep_interval(),
        )))
        .shutdown(shutdown)
        .build()?;

    let max_cycles = if args.once { Some(1) } else { args.max_cycles };
    match max_cycles {
        Some(max) => {
            let reports = scheduler.run_cycles(max).await?;
            for report in &reports {
                info!(
                    cycle = report.cycle,
                    results = report.results.len(),
                    duration_ms = report.duration.as_millis() as u64,
                    "Cycle summary"
                );
            }
        }
        None => scheduler.run().await?,
    }

    info!("Shutdown complete");
    Ok(())
}
