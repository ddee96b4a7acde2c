use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use nerve_domain::config::{Config, ConfigSeverity};
use nerve_domain::render::FallbackRenderer;
use nerve_domain::signal::{types, Signal};
use nerve_gateway::api;
use nerve_gateway::bus::{Bus, SignalIngress};
use nerve_gateway::cli::{Cli, Command, ConfigCommand};
use nerve_gateway::extremities::{CliExtremity, Extremity, ExtremityDrain};
use nerve_gateway::maintenance::ObservabilityMaintenance;
use nerve_gateway::runtime::{
    register_builtin_kinds, ActionRegistry, ExecutorRegistry, FsmEngine, GuardRegistry,
    PlanWorker, ProgramRegistry, RuntimeContext, SliceWorker, TimedScheduler,
};
use nerve_gateway::senses::{CliSense, QueuePoller, Sense};
use nerve_gateway::state::AppState;
use nerve_store::Store;
use nerve_tools::{EchoTool, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None => {
            init_tracing();
            let config = nerve_gateway::cli::load_config(&cli.config)?;
            run_server(Arc::new(config), false).await
        }
        Some(Command::Serve { cli: with_cli }) => {
            init_tracing();
            let config = nerve_gateway::cli::load_config(&cli.config)?;
            run_server(Arc::new(config), with_cli).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = nerve_gateway::cli::load_config(&cli.config)?;
            if !nerve_gateway::cli::validate(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = nerve_gateway::cli::load_config(&cli.config)?;
            nerve_gateway::cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("nerve {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve path.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,nerve_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>, with_cli: bool) -> anyhow::Result<()> {
    tracing::info!("nerve starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!("config validation failed");
    }

    // ── Persistent store ─────────────────────────────────────────────
    let store = Arc::new(
        Store::open(&config.store.db_path)
            .with_context(|| format!("opening store at {}", config.store.db_path.display()))?,
    );
    store
        .seed_default_catalog(&config.fsm.initial_state)
        .context("seeding FSM catalog")?;
    let (states, signals, transitions) = store.catalog_counts().context("reading catalog")?;
    if transitions == 0 {
        anyhow::bail!("FSM catalog is empty; refusing to consume signals");
    }
    tracing::info!(states, signals, transitions, "catalog loaded");

    // ── Trace store ──────────────────────────────────────────────────
    let obs = match &config.observability.db_path {
        Some(path) if *path != config.store.db_path => Arc::new(
            Store::open(path).with_context(|| format!("opening trace store at {}", path.display()))?,
        ),
        _ => store.clone(),
    };
    tracing::info!("observability store ready");

    // ── Registries ───────────────────────────────────────────────────
    let actions = Arc::new(ActionRegistry::with_builtins());
    let guards = Arc::new(GuardRegistry::with_builtins());
    store
        .validate_handler_keys(&actions.keys(), &guards.keys())
        .context("validating catalog handler keys")?;
    register_builtin_kinds(&store).context("registering plan kinds")?;
    tracing::info!(actions = actions.keys().len(), guards = guards.keys().len(), "handler registries ready");

    // ── Providers & tools ────────────────────────────────────────────
    let llm = nerve_providers::create_provider(&config.llm).context("initializing LLM provider")?;
    match &llm {
        Some(provider) => tracing::info!(provider = provider.provider_id(), "LLM provider ready"),
        None => tracing::info!("no LLM provider configured; deterministic handlers only"),
    }
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));
    let tools = Arc::new(tools);
    tracing::info!(tools = tools.len(), "tool registry ready");

    // ── Runtime context & bus ────────────────────────────────────────
    let ctx = Arc::new(RuntimeContext::new(
        store.clone(),
        tools,
        Arc::new(FallbackRenderer),
        llm,
    ));
    let (bus, fsm_rx) = Bus::new(config.fsm.bus_capacity, config.fsm.publish_mode);
    let ingress = SignalIngress::new(bus.clone(), store.clone());

    // ── FSM engine ───────────────────────────────────────────────────
    let (engine, shutdown_rx) = FsmEngine::new(
        store.clone(),
        obs.clone(),
        ctx.clone(),
        actions,
        guards,
        bus.clone(),
        config.fsm.clone(),
        &config.slices,
    );
    let fsm_handle = tokio::spawn(engine.run(fsm_rx));
    tracing::info!(initial_state = %store.current_state().unwrap_or_default(), "fsm engine ready");

    // ── Workers ──────────────────────────────────────────────────────
    tokio::spawn(QueuePoller::new(store.clone(), bus.clone()).run(shutdown_rx.clone()));
    tokio::spawn(
        TimedScheduler::new(store.clone(), obs.clone(), config.scheduler.clone()).run(shutdown_rx.clone()),
    );
    tokio::spawn(
        PlanWorker::new(
            store.clone(),
            obs.clone(),
            bus.clone(),
            ctx.clone(),
            Arc::new(ExecutorRegistry::with_builtins()),
        )
        .run(shutdown_rx.clone()),
    );
    let programs = Arc::new(ProgramRegistry::with_builtins());
    for i in 0..config.slices.workers {
        tokio::spawn(
            SliceWorker::new(
                store.clone(),
                obs.clone(),
                bus.clone(),
                ctx.clone(),
                programs.clone(),
                config.slices.clone(),
                format!("slice-{i}"),
            )
            .run(shutdown_rx.clone()),
        );
    }
    let extremities: Vec<Arc<dyn Extremity>> = vec![Arc::new(CliExtremity)];
    tokio::spawn(ExtremityDrain::new(store.clone(), obs.clone(), extremities).run(bus.clone(), shutdown_rx.clone()));
    tokio::spawn(
        ObservabilityMaintenance::new(obs.clone(), config.observability.clone()).run(shutdown_rx.clone()),
    );
    tracing::info!(slice_workers = config.slices.workers, "workers running");

    // ── Senses ───────────────────────────────────────────────────────
    if with_cli {
        let sense = CliSense::new("local");
        let _sense_handle = sense.start(ingress.clone(), shutdown_rx.clone());
        tracing::info!(sense = sense.key(), "cli sense attached");
    }

    // ── HTTP gateway ─────────────────────────────────────────────────
    let app_state = AppState {
        config: config.clone(),
        store: store.clone(),
        obs: obs.clone(),
        bus: bus.clone(),
        ingress: ingress.clone(),
        api_token_hash: config.api.token.as_deref().map(AppState::token_hash),
    };
    let router = api::router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.api.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.api.listen_addr))?;
    tracing::info!(addr = %config.api.listen_addr, "http gateway listening");
    let mut http_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "http gateway failed");
        }
    });

    // ── Shutdown wiring ──────────────────────────────────────────────
    let shutdown_bus = bus.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, requesting shutdown");
            let signal = Signal::new(types::SHUTDOWN_REQUESTED, "os", serde_json::json!({}));
            if let Err(e) = shutdown_bus.publish(signal).await {
                tracing::warn!(error = %e, "shutdown signal not accepted");
            }
        }
    });

    // The engine exits once the machine reaches its terminal state; every
    // worker observes the same watch channel.
    fsm_handle.await.context("fsm engine task")?;
    tracing::info!("nerve stopped");
    Ok(())
}
