//! XRPL Escrow Engine - liquidation and settlement for collateralized loans
//!
//! Borrowers lock collateral in hash-locked escrows whose fulfillment only this
//! engine holds. The engine values open loans against the live order book,
//! finishes undercollateralized escrows and cancels expired ones.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod config;
mod coordination;
mod error;
mod events;
mod ledger;
mod metrics;
mod notify;
mod oracle;
mod pubsub;
mod state;
mod tx;

use config::Settings;
use coordination::{Coordinator, ExpirySweeper, SettlementHandle};
use ledger::{Ledger, LedgerWatcher, XrplClient};
use metrics::MetricsServer;
use notify::LogNotifier;
use oracle::{LiquidationPoller, LiquidityOracle};
use pubsub::Broker;
use state::{StateManager, Store};
use tx::{CustodySigner, FeeSchedule, TransactionSender};

/// Health loop period
const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting XRPL Escrow Engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for custody account {}",
        settings.custody.account
    );

    // Initialize database connection
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    state_manager.run_migrations().await?;
    info!("Database migrations complete");
    let store: Arc<dyn Store> = state_manager.clone();

    // Custody key
    let signer = CustodySigner::from_seed(&settings.custody.account, &settings.custody_secret()?)?;

    // Ledger connection
    let ledger: Arc<dyn Ledger> = Arc::new(XrplClient::new(settings.ledger.clone()).await?);
    info!("Ledger connection established");

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    let broker = Arc::new(Broker::new(
        settings.engine.max_channels,
        settings.engine.channel_capacity,
    ));
    let oracle = Arc::new(LiquidityOracle::new(
        ledger.clone(),
        signer.account(),
        &settings.ledger,
    ));

    // Initialize coordinator and its settlement queue
    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        oracle,
        TransactionSender::new(ledger.clone(), signer),
        FeeSchedule::new(settings.fees.clone()),
        broker.clone(),
        settings.engine.clone(),
    ));
    let (settlement, commands) = SettlementHandle::channel(settings.engine.channel_capacity);
    info!("Coordinator initialized");

    let watcher = Arc::new(LedgerWatcher::new(
        ledger.clone(),
        store.clone(),
        broker.clone(),
        Arc::new(LogNotifier),
        &settings.engine,
    ));
    let sweeper = Arc::new(ExpirySweeper::new(
        store.clone(),
        settlement.clone(),
        settings.engine.sweep_interval_secs,
    ));
    let poller = Arc::new(LiquidationPoller::new(
        store.clone(),
        coordinator.oracle().clone(),
        broker.clone(),
        settlement.clone(),
        settings.engine.poll_pause_ms,
    ));

    // Start settlement worker
    let settlement_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.run(commands).await }
    });

    // Start API server
    let api_handle = tokio::spawn({
        let state = api::AppState {
            store: store.clone(),
            ledger: ledger.clone(),
            coordinator: coordinator.clone(),
            settlement: settlement.clone(),
            broker: broker.clone(),
            max_attempts: settings.engine.max_attempts,
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start ledger watcher
    let watcher_handle = tokio::spawn({
        let watcher = watcher.clone();
        async move { watcher.run().await }
    });

    // Start expiry sweeper
    let sweeper_handle = tokio::spawn({
        let sweeper = sweeper.clone();
        async move { sweeper.run().await }
    });

    // Start liquidation poller
    let poller_handle = tokio::spawn({
        let poller = poller.clone();
        async move { poller.run().await }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let ledger = ledger.clone();
        let store = store.clone();
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS))
                    .await;

                let ledger_ok = ledger.health_check().await;
                metrics::record_ledger_health(ledger_ok);
                if !ledger_ok {
                    warn!("Ledger health check failed");
                }

                // Check database connection
                match store.health_check().await {
                    Ok(()) if ledger_ok => metrics::record_health_check(),
                    Ok(()) => metrics::record_health_check_failure(),
                    Err(e) => {
                        warn!("Database health check failed: {}", e);
                        metrics::record_health_check_failure();
                    }
                }
            }
        }
    });

    info!("XRPL Escrow Engine is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    poller.stop().await;
    sweeper.stop().await;
    watcher.stop().await;

    // Abort background tasks
    api_handle.abort();
    watcher_handle.abort();
    sweeper_handle.abort();
    poller_handle.abort();
    settlement_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!(
        "XRPL Escrow Engine stopped at ledger {}",
        watcher.last_ledger().await
    );
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,xrpl_escrow_engine=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
