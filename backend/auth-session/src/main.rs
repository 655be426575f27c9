/// Auth session maintenance job
///
/// Applies the `refresh_tokens` migration, then purges refresh token rows
/// past retention on the reaper interval until shut down.
use anyhow::{Context, Result};
use auth_session::clock::SystemClock;
use auth_session::config::Settings;
use auth_session::db::{PgRefreshTokenStore, StoreCallPolicy};
use auth_session::metrics::initialize_auth_session_metrics;
use auth_session::services::Reaper;
use auth_session::telemetry::init_tracing;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("Starting auth session maintenance");

    let settings = Settings::load().context("Failed to load configuration")?;
    let database = settings
        .database
        .as_ref()
        .context("DATABASE_URL must be set for the maintenance job")?;
    info!("Configuration loaded successfully");

    initialize_auth_session_metrics();

    let db_pool = PgPoolOptions::new()
        .max_connections(database.max_connections)
        .acquire_timeout(Duration::from_secs(database.acquire_timeout_secs))
        .connect(&database.url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    info!(
        "Database pool initialized with {} max connections",
        database.max_connections
    );

    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .context("Failed to run database migrations")?;
    info!("Database migrations completed");

    let store = Arc::new(PgRefreshTokenStore::new(
        db_pool.clone(),
        StoreCallPolicy::from(&settings.store),
    ));

    let reaper = Reaper::new(
        settings.reaper.clone(),
        settings.lockout.lockout_duration(),
        Arc::new(SystemClock),
    )
    .with_store(store);

    let handle = reaper.start();

    shutdown_signal().await;
    handle.abort();
    if let Err(e) = handle.await {
        if !e.is_cancelled() {
            error!("Reaper task ended abnormally: {}", e);
        }
    }

    db_pool.close().await;
    info!("Auth session maintenance shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
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
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Shutting down gracefully...");
}
