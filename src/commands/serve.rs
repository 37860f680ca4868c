//! `leasehold serve`: background loops until Ctrl-C.
//!
//! Runs the idle reaper, the orphan detector and the lifecycle queue worker
//! (each if enabled), then pauses every running sandbox on shutdown.

use anyhow::{Context, Result};
use colored::Colorize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::Runtime;
use crate::notifications::Notifier;
use crate::orphans::OrphanDetector;
use crate::reaper::IdleReaper;
use crate::worker::LifecycleWorker;

pub(crate) async fn run(runtime: &Runtime) -> Result<()> {
    let config = &runtime.config;
    let notifier = Notifier::new(config.notifications.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    if config.reaper.enabled {
        let reaper = IdleReaper::new(
            runtime.manager.clone(),
            notifier.clone(),
            Duration::from_secs(config.reaper.interval_secs),
        );
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { reaper.run(rx).await });
    }

    if config.orphans.enabled {
        let detector = OrphanDetector::new(
            runtime.manager.clone(),
            notifier.clone(),
            Duration::from_secs(config.orphans.interval_secs),
        );
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { detector.run(rx).await });
    }

    let worker = LifecycleWorker::new(
        runtime.manager.clone(),
        runtime.queue.clone(),
        Duration::from_millis(config.queue.poll_interval_ms),
        Duration::from_secs(config.queue.claim_timeout_secs),
    );
    tasks.spawn(async move { worker.run(shutdown_rx).await });

    println!(
        "{} Serving with provider {} (Ctrl-C to stop)",
        "▶".green().bold(),
        runtime.manager.providers().active_name().cyan()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    // Errs only when every loop has already exited
    let _ = shutdown_tx.send(true);

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Background task panicked: {}", e);
        }
    }

    let paused = runtime.manager.pause_all_sessions().await;
    println!("{} Paused {} sandbox(es) on shutdown", "✓".green(), paused);
    Ok(())
}
