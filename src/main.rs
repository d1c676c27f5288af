//! PEERWAGER — peer-to-peer draw wagering engine
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores the engine snapshot from disk (or starts fresh), and runs the
//! scheduler loop with graceful shutdown.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use peerwager::clock::SystemClock;
use peerwager::config;
use peerwager::engine::scheduler::{Scheduler, TickReport};
use peerwager::engine::Engine;
use peerwager::storage;
use peerwager::transfer::{DryRunGateway, TransferGateway};
use peerwager::types::EngineEvent;

const BANNER: &str = r#"
  ___ ___ ___ ___ __      ___   ___ ___ ___
 | _ \ __| __| _ \\ \    / /_\ / __| __| _ \
 |  _/ _|| _||   / \ \/\/ / _ \ (_ | _||   /
 |_| |___|___|_|_\  \_/\_/_/ \_\___|___|_|_\

  Peer-to-peer draw wagering engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        min_stake = cfg.engine.min_stake,
        max_stake = cfg.engine.max_stake,
        fee_rate = %cfg.engine.fee_rate,
        sources = cfg.consensus.sources.len(),
        quorum = cfg.consensus.quorum,
        tick_secs = cfg.scheduler.tick_secs,
        "PEERWAGER starting up"
    );
    for warning in cfg.warnings() {
        warn!("{warning}");
    }

    // -- Restore or create engine ------------------------------------------

    let state_file = cfg.storage.state_file.as_str();
    let gateway: Arc<dyn TransferGateway> = Arc::new(DryRunGateway);
    info!(gateway = gateway.name(), "Transfer gateway ready");

    let engine = match storage::load_snapshot(Some(state_file))? {
        Some(snapshot) => Engine::restore(
            snapshot,
            cfg.engine.clone(),
            cfg.consensus.clone(),
            Arc::new(SystemClock),
            gateway,
        ),
        None => {
            info!("Fresh start");
            Engine::new(
                cfg.engine.clone(),
                cfg.consensus.clone(),
                Arc::new(SystemClock),
                gateway,
            )
        }
    };
    let engine = Arc::new(engine);

    // -- Outbound event log ------------------------------------------------

    let mut events = engine.subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // -- Main loop ---------------------------------------------------------

    let scheduler = Scheduler::new(Arc::clone(&engine), cfg.scheduler.clone());
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.scheduler.tick_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.scheduler.tick_secs,
        "Entering scheduler loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = scheduler.tick().await;
                log_tick_report(&report);
                // Persist after each tick
                if let Err(e) = storage::save_snapshot(&engine.snapshot().await, Some(state_file)) {
                    error!(error = %e, "Failed to save snapshot");
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    // Save final state
    let snapshot = engine.snapshot().await;
    storage::save_snapshot(&snapshot, Some(state_file))?;
    event_logger.abort();
    info!(
        rounds = snapshot.rounds.len(),
        next_round_id = snapshot.next_round_id,
        "PEERWAGER shut down cleanly."
    );

    Ok(())
}

fn log_tick_report(report: &TickReport) {
    for (round_id, e) in &report.failed {
        warn!(round_id, error = %e, kind = ?e.kind(), "Round needs attention");
    }
}

fn log_event(event: &EngineEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(round_id = event.round(), event = %json, "Engine event"),
        Err(e) => warn!(error = %e, "Failed to encode engine event"),
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("peerwager=info"));

    let json_logging = std::env::var("PEERWAGER_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
