use anyhow::Context;
use event_bus::consumer_retry::RetryConfig;
use event_bus::{EventBus, InMemoryBus, NatsBus};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use vehicles_rs::{
    build_router, config::Config, db::init_pool, services::vehicle_service::VehicleService,
    start_vehicle_type_consumer, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting vehicles service...");

    let config = Config::from_env().map_err(anyhow::Error::msg)?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        bus_type = %config.bus_type,
        "Configuration loaded"
    );

    let pool = init_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;

    tracing::info!("Running migrations...");
    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let bus: Arc<dyn EventBus> = match config.bus_type.to_lowercase().as_str() {
        "inmemory" => {
            tracing::info!("Using InMemory event bus");
            Arc::new(InMemoryBus::new())
        }
        "nats" => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            let bus = NatsBus::connect(&config.nats_url)
                .await
                .context("failed to connect to NATS")?;
            Arc::new(bus)
        }
        other => anyhow::bail!("Invalid BUS_TYPE: {other}. Must be 'inmemory' or 'nats'"),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_task = start_vehicle_type_consumer(
        bus,
        pool.clone(),
        config.vehicle_type_subject(),
        RetryConfig::new(config.consumer_max_attempts, Duration::from_millis(100), Duration::from_secs(5)),
        shutdown_rx,
    );

    let app = build_router(Arc::new(AppState {
        vehicles: VehicleService::new(pool.clone()),
    }))
    .layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("HOST/PORT do not form a socket address")?;
    tracing::info!("Vehicles service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("server failed")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = consumer_task.await {
        tracing::error!(error = %e, "Vehicle type consumer task panicked");
    }
    pool.close().await;

    Ok(())
}
