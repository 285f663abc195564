use change_capture::{CaptureConfig, CaptureService, PgChangeLog, PgCursorStore};
use message_bus::{
    BrokerConnector, ConnectionManager, InMemoryConnector, NatsConnector, Publisher, Topology,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
use config::Config;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting capture relay...");

    // Load configuration from environment
    let config = Config::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        "Configuration loaded: bus_type={}, entity_types={:?}, interval={:?}",
        config.bus_type,
        config.entity_types,
        config.poll_interval
    );

    // Database connection
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    tracing::info!("Running migrations...");
    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    // Select broker transport
    let connector: Box<dyn BrokerConnector> = match config.bus_type.to_lowercase().as_str() {
        "inmemory" => {
            tracing::info!("Using InMemory broker");
            Box::new(InMemoryConnector::default())
        }
        "nats" => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            Box::new(NatsConnector::new(config.nats_url.clone()))
        }
        other => panic!("Invalid BUS_TYPE: {}. Must be 'inmemory' or 'nats'", other),
    };

    // Connect with bounded backoff; exhaustion is a startup failure
    let manager = Arc::new(ConnectionManager::new(connector, Topology::default()));
    manager.connect().await.expect("Failed to connect to broker");

    // Start the capture poll loop
    let service = CaptureService::new(
        Arc::new(PgChangeLog::new(pool.clone())),
        Arc::new(PgCursorStore::new(pool.clone())),
        Publisher::new(manager.clone()),
        CaptureConfig {
            entity_types: config.entity_types.clone(),
            poll_interval: config.poll_interval,
            batch_limit: config.batch_limit,
            source: config.source.clone(),
        },
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn(async move { service.run(stop_rx).await });

    // Graceful shutdown: stop polling, let the in-flight cycle finish,
    // then release the broker connection
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    tracing::info!("Shutdown signal received, finishing in-flight cycle...");

    stop_tx.send(true).ok();
    worker.await.expect("Capture worker panicked");
    manager.disconnect().await.ok();

    tracing::info!("Capture relay stopped");
}
