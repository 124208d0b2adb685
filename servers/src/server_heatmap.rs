//! # Heating-Network Map Server
//!
//! Ingests device readings from the configured upstream feeds, keeps the
//! latest state per device, and pushes consistent snapshots to map clients
//! connected on `/ws/map`.
//!
//! ## Workflow:
//! 1.  **Configuration**: `.env`, then defaults < JSON file < env/CLI.
//! 2.  **Logging**: console plus daily rolling file.
//! 3.  **Contracts**: the contract book is loaded once and shared read-only.
//! 4.  **Tasks**: broadcaster, one transport and one ingest task per feed,
//!     the monitor, and the HTTP server.
//! 5.  **Shutdown**: Ctrl-C or SIGTERM cancels everything. A fatal monitor
//!     error or a failed HTTP server does the same and ends the process with
//!     a non-zero exit code.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_heatmap::core::{IngestCoordinator, SnapshotBroadcaster, SubscriptionRegistry};
use lib_heatmap::loggers;
use lib_heatmap::models::ContractBook;
use lib_heatmap::DeviceStateTable;

mod heatmap_logic;
use heatmap_logic::{config, downstream, monitor, state::AppState, upstream};

// How long tasks get to wind down after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Phase 1: Environment and configuration ---
    let _ = dotenvy::dotenv();
    let settings = config::load_config()?;

    // --- Phase 2: Logging ---
    // The guard must live until exit so buffered lines are flushed.
    let _log_guard = loggers::init_tracing(&settings.log_settings()).context("failed to initialize logging")?;

    // --- Phase 3: Contracts ---
    let contracts = match &settings.contracts_path {
        Some(path) => ContractBook::from_file(path)?,
        None => {
            tracing::warn!("no contract book configured; every correctness flag will be false");
            ContractBook::default()
        }
    };
    tracing::info!(contracts = contracts.len(), "contract book loaded");

    // --- Phase 4: Core ---
    let table = Arc::new(DeviceStateTable::new());
    let registry = Arc::new(SubscriptionRegistry::new());
    let ingest = IngestCoordinator::new(table.clone(), Arc::new(contracts));
    let broadcaster = Arc::new(SnapshotBroadcaster::new(
        table.clone(),
        registry.clone(),
        settings.broadcast_config(),
    ));
    let app_state = AppState::new(
        table,
        registry,
        broadcaster.clone(),
        ingest.clone(),
        settings.write_timeout,
    );

    // --- Phase 5: Tasks ---
    let shutdown = CancellationToken::new();

    // Subscribed before any feed runs so early disconnects reach /stats.
    let disconnects = ingest.on_feed_disconnected();
    let broadcaster_handle = tokio::spawn(broadcaster.run(shutdown.clone()));
    let feed_handles = upstream::spawn_feeds(&settings, &ingest, &shutdown)?;
    let mut monitor_handle = tokio::spawn(monitor::run(
        settings.clone(),
        app_state.clone(),
        disconnects,
        shutdown.clone(),
    ));
    let mut downstream_handle = tokio::spawn(downstream::run(settings.clone(), app_state, shutdown.clone()));

    // --- Phase 6: Wait for a signal, a fatal monitor error or a server failure ---
    let (early_monitor, early_downstream) = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
            (None, None)
        }
        res = &mut monitor_handle => (Some(res), None),
        res = &mut downstream_handle => (None, Some(res)),
    };

    shutdown.cancel();

    // --- Phase 7: Drain ---
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let monitor_result = match early_monitor {
            Some(res) => res,
            None => monitor_handle.await,
        };
        let downstream_result = match early_downstream {
            Some(res) => res,
            None => downstream_handle.await,
        };
        let _ = broadcaster_handle.await;
        for handle in feed_handles {
            let _ = handle.await;
        }
        (monitor_result, downstream_result)
    })
    .await;

    let (monitor_result, downstream_result) = drained.context("tasks did not finish within the shutdown grace period")?;
    monitor_result.context("monitor task panicked")??;
    downstream_result.context("downstream task panicked")??;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    // Handler for CTRL+C
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    // Handler for SIGTERM (on UNIX systems)
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    // On non-UNIX systems, `terminate` is a future that never completes.
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
