//! Courier outbound webhook delivery service.
//!
//! Loads configuration, connects to Postgres, starts the delivery engine and
//! serves the HTTP API until SIGTERM or CTRL+C. On shutdown the API drains
//! first, then the engine finishes in-flight attempts.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{AppState, Config};
use courier_core::{storage::Storage, Clock, RealClock};
use courier_delivery::{DeliveryEngine, WebhookService};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

const DB_CONNECT_ATTEMPTS: u32 = 5;
const DB_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!("starting courier webhook delivery service");
    let addr = config.parse_server_addr()?;
    info!(
        database_url = %config.database_url_masked(),
        server_addr = %addr,
        max_connections = config.database_max_connections,
        concurrency = config.dispatch_concurrency,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    let storage = Arc::new(Storage::new(pool.clone()));
    storage.migrate().await.context("failed to run database migrations")?;
    info!("database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let mut engine =
        DeliveryEngine::postgres(storage.clone(), config.to_engine_config(), clock.clone())
            .context("failed to create delivery engine")?;
    engine.start().await.context("failed to start delivery engine")?;

    let service = Arc::new(WebhookService::postgres(
        storage.clone(),
        config.to_guard_config(),
        clock.clone(),
    ));
    let state = AppState::new(service, Some(storage), clock);

    let served = courier_api::start_server(
        state,
        addr,
        Duration::from_secs(config.request_timeout),
    )
    .await
    .context("HTTP server failed");

    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "delivery engine did not shut down cleanly");
    }

    pool.close().await;
    info!("courier shutdown complete");
    served
}

fn init_tracing(directives: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives)
        .with_context(|| format!("invalid log filter: {directives}"))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Connects to Postgres, retrying while the database comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut attempt = 0;

    loop {
        attempt += 1;
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                info!("database connection pool established");
                return Ok(pool);
            },
            Err(e) if attempt < DB_CONNECT_ATTEMPTS => {
                warn!(
                    attempt,
                    max_attempts = DB_CONNECT_ATTEMPTS,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(DB_RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool");
            },
        }
    }
}
