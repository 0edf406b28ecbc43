mod bootstrap;
mod commerce;
mod health;
mod routes;

use anyhow::Result;

use cartwheel_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use cartwheel_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let router = routes::router(app.engine.clone()).merge(health::router(app.health.clone()));
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tracing::info!(
        event_name = "system.server.started",
        bind_address = %address,
        "cartwheel-server listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(app.config.server.graceful_shutdown_secs))
        .await?;

    tracing::info!(event_name = "system.server.stopped", "cartwheel-server stopped");

    Ok(())
}

async fn shutdown_signal(grace_secs: u64) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!(
        event_name = "system.server.stopping",
        grace_secs,
        "shutdown signal received, draining connections"
    );
}
