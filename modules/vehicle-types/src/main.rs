use anyhow::Context;
use event_bus::{EventBus, InMemoryBus, NatsBus};
use outbox::{ChangeChannel, OutboxPublisher, OutboxStore, PgChangeChannel, PgOutboxStore, PublisherConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;
use webhooks::{
    ForwarderConfig, NotifierConfig, PgDeliveryLog, PgDeliveryQueue, PgSubscriptionStore, ReqwestTransport,
    WebhookForwarder, WebhookMetadata, WebhookNotifier,
};

use vehicle_types_rs::{
    build_router, config::Config, db::init_pool, services::vehicle_type_service::VehicleTypeService,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting vehicle-types service...");

    let config = Config::from_env().map_err(anyhow::Error::msg)?;

    tracing::info!(
        host = %config.host,
        port = config.port,
        bus_type = %config.bus_type,
        subject_prefix = %config.subject_prefix,
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

    let bus = connect_bus(&config).await?;
    let channel: Arc<dyn ChangeChannel> = Arc::new(PgChangeChannel::new(pool.clone()));
    let outbox_store: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let forwarder_task = if config.webhooks_enabled {
        let notifier = WebhookNotifier::new(
            Arc::new(PgSubscriptionStore::new(pool.clone())),
            Arc::new(ReqwestTransport::new(config.webhook_timeout)?),
            Arc::new(PgDeliveryLog::new(pool.clone())),
            NotifierConfig {
                max_concurrency: config.webhook_max_concurrency,
                ..NotifierConfig::default()
            },
        );
        let forwarder = Arc::new(WebhookForwarder::new(
            outbox_store.clone(),
            Arc::new(PgDeliveryQueue::new(pool.clone())),
            Arc::new(notifier),
            config.webhook_version.clone(),
            WebhookMetadata {
                source: config.webhook_source.clone(),
                environment: config.webhook_environment.clone(),
            },
            ForwarderConfig {
                poll_interval: config.webhook_poll_interval,
                ..ForwarderConfig::default()
            },
        ));
        Some(tokio::spawn(forwarder.run(shutdown_rx.clone())))
    } else {
        tracing::info!("Webhook forwarding disabled");
        None
    };

    let publisher = Arc::new(OutboxPublisher::new(
        outbox_store.clone(),
        bus.clone(),
        PublisherConfig {
            subject_prefix: config.subject_prefix.clone(),
            source_module: "vehicle-types".to_string(),
            source_version: env!("CARGO_PKG_VERSION").to_string(),
            batch_size: config.outbox_batch_size,
            sweep_interval: config.outbox_sweep_interval,
            retry_interval: config.outbox_retry_interval,
            max_retries: config.outbox_max_retries,
            publish_timeout: config.publish_timeout,
            ..PublisherConfig::default()
        },
    ));
    let publisher_task = tokio::spawn(publisher.run(channel.clone(), shutdown_rx.clone()));

    let state = Arc::new(AppState {
        vehicle_types: VehicleTypeService::new(pool.clone(), channel),
        outbox: outbox_store,
    });

    let app = build_router(state).layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("HOST/PORT do not form a socket address")?;
    tracing::info!("Vehicle-types service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    tracing::info!("Shutting down background tasks...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = publisher_task.await {
        tracing::error!(error = %e, "Outbox publisher task panicked");
    }
    if let Some(task) = forwarder_task {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Webhook forwarder task panicked");
        }
    }
    pool.close().await;

    Ok(())
}

async fn connect_bus(config: &Config) -> anyhow::Result<Arc<dyn EventBus>> {
    match config.bus_type.to_lowercase().as_str() {
        "inmemory" => {
            tracing::info!("Using InMemory event bus");
            Ok(Arc::new(InMemoryBus::new()))
        }
        "nats" => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            let bus = NatsBus::connect(&config.nats_url)
                .await
                .context("failed to connect to NATS")?;
            Ok(Arc::new(bus))
        }
        other => anyhow::bail!("Invalid BUS_TYPE: {other}. Must be 'inmemory' or 'nats'"),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
