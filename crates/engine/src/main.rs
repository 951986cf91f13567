//! RapidPot service entry point.
//!
//! Startup order: dotenv, tracing, configuration, chain client, state
//! recovery, draw schedulers, HTTP server. Ctrl-C stops the server and
//! the schedulers; draws that have started run to completion, bounded by
//! [`ServiceConfig::draw_drain_limit`].

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rapidpot_engine::{
    build_router, load_env_file, AppState, DrawScheduler, EngineDeps, FileBackend, OsRandom,
    PotEngine, ServiceConfig, SolanaRpcClient,
};

#[tokio::main]
async fn main() {
    let env_file = load_env_file();

    let config = match ServiceConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Some(path) = env_file {
        info!(path = %path.display(), "loaded environment file");
    }

    if let Err(e) = run(config).await {
        error!("fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: ServiceConfig) -> anyhow::Result<()> {
    info!(?config, "starting rapidpot");

    let keypair = config.keypair().context("loading payout keypair")?;
    let client = Arc::new(
        SolanaRpcClient::new(&config.rpc_url, config.rpc_timeout, Some(keypair))
            .context("building RPC client")?,
    );

    let engine = Arc::new(
        PotEngine::new(
            config.engine_settings(),
            EngineDeps {
                chain: client.clone(),
                submitter: client.clone(),
                balances: client.clone(),
                backend: Arc::new(FileBackend::new(&config.state_path)),
                rng: Arc::new(OsRandom),
            },
        )
        .context("opening engine")?,
    );

    let report = engine.recover().await.context("recovering in-flight draws")?;
    if !report.reinstated.is_empty() || !report.unresolved.is_empty() {
        warn!(
            reinstated = ?report.reinstated,
            unresolved = ?report.unresolved,
            "recovered draws from previous run"
        );
    }

    let admin = engine.admin_address();
    match client.balance(admin).await {
        Ok(balance) => info!(address = admin, balance = %balance, "admin wallet balance"),
        Err(e) => warn!(address = admin, error = %e, "admin balance lookup failed"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let schedulers =
        DrawScheduler::spawn_all(engine.pot_configs(), engine.orchestrator(), &shutdown_rx);

    let state = Arc::new(AppState::new(engine.clone(), config.admin_token.clone()));
    if state.admin_token.is_none() {
        warn!("ADMIN_TOKEN not set; admin routes are disabled");
    }
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("binding {}", config.http_addr))?;
    info!(addr = %config.http_addr, "HTTP server listening");

    let signal = shutdown_tx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
            signal.send_replace(true);
        })
        .await
        .context("HTTP server error")?;

    // Schedulers finish the draw they are in, then see the flag.
    shutdown_tx.send_replace(true);
    let drain_limit = config.draw_drain_limit();
    let drained = tokio::time::timeout(drain_limit, async {
        for handle in schedulers {
            if let Err(e) = handle.await {
                error!(error = %e, "draw scheduler task failed");
            }
        }
        engine.wait_for_draws().await
    })
    .await;
    match drained {
        Ok(0) => {}
        Ok(n) => info!(draws = n, "running draws finished"),
        Err(_) => warn!(
            limit_secs = drain_limit.as_secs(),
            running = engine.orchestrator().running_draws(),
            "draws still running at shutdown limit; their pots recover as unresolved"
        ),
    }

    engine.flush().await.context("flushing state")?;
    info!("rapidpot stopped");
    Ok(())
}
