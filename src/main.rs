//! Libris Server - Library Circulation System
//!
//! Boots the stores and services, then runs the background jobs until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use libris_server::{
    clock::SystemClock,
    config::{AppConfig, LoggingConfig},
    repository::Repository,
    services::{email::EmailService, jobs, redis::RedisService, Services},
    AppState,
};

/// Install the global subscriber; the guard must live as long as the process
fn init_tracing(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("libris_server={},sqlx=warn", config.level).into());

    let (writer, guard) = match config.directory.as_deref() {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "libris.log"));
            (tracing_subscriber::fmt::writer::BoxMakeWriter::new(writer), Some(guard))
        }
        None => (
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stdout),
            None,
        ),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .init();
    }

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().context("Failed to load configuration")?;

    let _log_guard = init_tracing(&config.logging);

    tracing::info!("Starting Libris Server v{}", env!("CARGO_PKG_VERSION"));

    // Create database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(config.engine.store_timeout())
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Connected to database");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    tracing::info!("Database migrations completed");

    // Reset tokens live in Redis
    let redis_service = RedisService::new(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;

    tracing::info!("Connected to Redis");

    let repository = Repository::new(pool);
    let services = Services::new(
        repository,
        Arc::new(redis_service),
        Arc::new(EmailService::new(config.email.clone())),
        Arc::new(SystemClock),
        &config,
    );

    let state = AppState {
        config: Arc::new(config),
        services: Arc::new(services),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = jobs::spawn_all(&state.services, &state.config.jobs, shutdown_rx)
        .context("Failed to start background jobs")?;

    tracing::info!("{} ready", state.config.server.name);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!("Job ended abnormally: {}", e);
        }
    }

    Ok(())
}
