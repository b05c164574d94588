mod bootstrap;
mod health;
mod maintenance;

use std::time::Duration;

use anyhow::Result;
use dona_core::config::{AppConfig, LoadOptions};
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use dona_core::config::LogFormat::*;

    // RUST_LOG wins over the configured level when set
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        health::HealthState::new(app.db_pool.clone(), app.audit.clone()),
    )
    .await?;

    let reclaimer = maintenance::spawn_bucket_reclaimer(
        app.limiter.clone(),
        Duration::from_secs(app.config.rate_limit.cleanup_interval_secs),
    );

    let reporter = maintenance::spawn_metrics_reporter(
        app.metrics.clone(),
        Duration::from_secs(app.config.middleware.metrics_report_interval_secs),
    );

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        "dona-server started"
    );

    tokio::select! {
        result = app.slack_runner.start() => {
            result?;
            tracing::info!(
                event_name = "system.server.transport_closed",
                correlation_id = "bootstrap",
                "slack transport closed; waiting for shutdown signal"
            );
            wait_for_shutdown().await?;
        }
        signal = wait_for_shutdown() => signal?,
    }

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "dona-server stopping"
    );

    reclaimer.abort();
    reporter.abort();
    maintenance::report(&app.metrics, std::time::Instant::now());
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if tokio::time::timeout(grace, app.audit.flush()).await.is_err() {
        tracing::warn!(
            event_name = "system.server.audit_flush_timeout",
            correlation_id = "shutdown",
            pending = ?app.audit.health(),
            "audit queue not drained before shutdown deadline"
        );
    }
    app.audit_worker.abort();
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
