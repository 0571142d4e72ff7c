//! Sluice event delivery gateway.
//!
//! Service entry point: initializes logging, loads configuration, connects
//! to PostgreSQL, and runs the delivery engine until a shutdown signal.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use config::Config;
use sluice_core::{storage::Storage, time::RealClock};
use sluice_delivery::{
    queue::InMemoryQueue,
    storage::{DeliveryStorage, PostgresDeliveryStorage},
    DeliveryEngine,
};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url_masked(),
        worker_pool_size = config.worker_pool_size,
        "starting sluice delivery gateway"
    );

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    sqlx::migrate!().run(&pool).await.context("failed to run database migrations")?;
    info!("database migrations applied");

    let clock = Arc::new(RealClock::new());
    let queue = Arc::new(InMemoryQueue::new());
    let storage = Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(pool.clone()))));

    let mut engine = DeliveryEngine::with_storage(
        storage as Arc<dyn DeliveryStorage>,
        queue.clone(),
        config.to_delivery_config(),
        clock,
        None,
        Some(queue.notifier()),
    )?;
    engine.start().await?;
    info!("sluice is delivering events");

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight deliveries");

    engine.shutdown().await?;
    pool.close().await;
    info!("sluice shutdown complete");

    Ok(())
}

/// Initializes tracing with environment-based filtering.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database pool with connect retries.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(_) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received CTRL+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
