use anyhow::{Context, Result};
use std::time::Duration;
use thermoband_gateway::config::{DatabaseBackend, GatewayConfig};
use thermoband_gateway::ingest_server::IngestServer;
use thermoband_gateway::pg_store::PgStore;
use thermoband_gateway::store::Stores;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = GatewayConfig::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.logging.level, &config.logging.format);

    info!(
        service = %config.service.name,
        "Starting ThermoBand Gateway"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Wire up persistence
    let stores = match config.database.backend {
        DatabaseBackend::Postgres => {
            let store = PgStore::connect(&config.database)
                .await
                .context("Failed to initialize PostgreSQL stores")?;

            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Stores::postgres(store)
        }
        DatabaseBackend::Memory => {
            warn!("Using in-memory stores; readings will not survive a restart");
            Stores::memory()
        }
    };

    let shutdown = CancellationToken::new();

    // Bind and spawn the ingestion server
    let server = IngestServer::bind(&config.server, stores.readings.clone(), shutdown.clone())
        .await
        .context("Failed to start ingestion server")?;

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Ingestion server error");
        }
    });

    info!("Gateway started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down gateway");

    shutdown.cancel();
    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Ingestion server task failed"),
        Err(_) => warn!("Ingestion server did not stop within 5s"),
    }

    info!("Gateway stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
