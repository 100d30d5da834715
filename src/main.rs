use newsletter_core::config::Settings;
use newsletter_core::observability::{init_logging, init_metrics, LogConfig};
use newsletter_core::outbox::{DispatcherConfig, HttpEmailSender, OutboxDispatcher, RetentionJob};
use newsletter_core::repositories::{PgStore, Store};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let settings = Settings::new()?;
    init_logging(&LogConfig::from(&settings.application));
    info!("Configuration loaded");

    init_metrics(settings.application.metrics_port)?;
    info!(port = settings.application.metrics_port, "Prometheus exporter listening");

    let pool = PgPoolOptions::new()
        .max_connections(settings.database.pool_size)
        .acquire_timeout(Duration::from_secs(settings.database.acquire_timeout_secs))
        .connect(&settings.database.url)
        .await?;
    info!("Database connection established");

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations applied successfully");

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let sender = Arc::new(HttpEmailSender::new(&settings.email)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Arc::new(OutboxDispatcher::new(
        Arc::clone(&store),
        sender,
        DispatcherConfig::from(&settings.outbox),
    )?);
    let mut workers = vec![dispatcher.start(shutdown_rx.clone())];

    if settings.outbox.retention_hours > 0 {
        let retention = RetentionJob::new(
            Arc::clone(&store),
            chrono::Duration::hours(settings.outbox.retention_hours),
            Duration::from_secs(3600),
        );
        workers.push(retention.start(shutdown_rx));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown_tx.send(true)?;

    for worker in workers {
        worker.await?;
    }
    info!("Outbox worker stopped");

    Ok(())
}
