//! Crash Round Server
//!
//! Runs the round scheduler and the WebSocket server side by side until
//! ctrl-c. Configuration comes from `CRASH_*` / `AUTH_*` environment
//! variables; log filtering from `RUST_LOG`.

use std::sync::Arc;
use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crash_round::{
    AppConfig, RoundEngine, VERSION,
    core::{clock::SystemClock, money::format_amount},
    game::{
        crash::{parse_tiers, TieredCrashPolicy},
        ledger::Ledger,
        scheduler::{resume_round_id, RoundScheduler},
        store::{JsonlRoundStore, MemoryRoundStore, RoundStore},
    },
    network::server::GameServer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let config = AppConfig::from_env();
    info!("Crash Round Server v{}", VERSION);
    info!(
        "Bets {}..={}, curve +{} every {}ms",
        format_amount(config.engine.min_bet),
        format_amount(config.engine.max_bet),
        config.engine.curve.step_hundredths,
        config.engine.curve.step_ms
    );
    if !config.auth.is_configured() {
        warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set; guests allowed: {}", config.server.allow_guests);
    }

    let store: Arc<dyn RoundStore> = match &config.archive_path {
        Some(path) => {
            info!("Archiving rounds to {}", path.display());
            Arc::new(JsonlRoundStore::new(path.clone()))
        }
        None => {
            warn!("CRASH_ARCHIVE_PATH not set; round archive is in-memory only");
            Arc::new(MemoryRoundStore::default())
        }
    };

    let first_round = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || resume_round_id(store.as_ref()))
            .await
            .context("archive scan panicked")?
            .context("failed to read round archive")?
    };
    info!("Starting at round {}", first_round);

    let engine = Arc::new(RoundEngine::new(
        config.engine.clone(),
        Arc::new(SystemClock::new()),
        Arc::new(Ledger::with_config(config.ledger.clone())),
        store,
        first_round,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let policy = match &config.crash_tiers {
        Some(text) => {
            let tiers = parse_tiers(text).context("invalid CRASH_TIERS")?;
            TieredCrashPolicy::with_tiers(tiers).context("invalid CRASH_TIERS")?
        }
        None => TieredCrashPolicy::from_entropy(),
    };
    info!("Crash tiers: {:?}", policy.tiers());

    let scheduler = RoundScheduler::new(engine.clone(), Arc::new(policy), config.schedule.clone());
    let scheduler_rx = shutdown_tx.subscribe();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_rx).await });

    let server = GameServer::new(config.server.clone(), config.auth.clone(), engine, shutdown_tx.clone());
    let mut server_task = tokio::spawn(async move { server.run().await });

    let server_done = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("Shutting down");
            None
        }
        result = &mut server_task => Some(result),
    };
    let _ = shutdown_tx.send(());

    let server_result = match server_done {
        Some(result) => result,
        None => server_task.await,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
    }

    scheduler_task
        .await
        .context("scheduler task failed")?
        .context("scheduler stopped with an error")?;

    info!("Stopped");
    Ok(())
}
