use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use dotenv::dotenv;
use tokio::sync::watch;
use tracing::{error, info, warn};

use inventory_engine::config::Config;
use inventory_engine::grpc::InventoryGrpcServer;
use inventory_engine::handlers;
use inventory_engine::metrics::Metrics;
use inventory_engine::nats::EventProducer;
use inventory_engine::nats_consumer::EventConsumer;
use inventory_engine::services::InventoryService;
use inventory_engine::store::PostgresLedgerStore;
use inventory_engine::sweeper::ExpirySweeper;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    let config = Config::from_env().expect("failed to load configuration");
    config.validate().expect("invalid configuration");

    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        http = format!("{}:{}", config.server.host, config.server.port),
        grpc = format!("{}:{}", config.grpc.host, config.grpc.port),
        "starting inventory engine"
    );

    let store = Arc::new(
        PostgresLedgerStore::connect(&config.database)
            .await
            .expect("failed to connect to database"),
    );
    store
        .run_migrations()
        .await
        .expect("failed to run migrations");
    info!("database connected");

    let producer = Arc::new(
        EventProducer::connect(&config.nats.url, config.nats.topics.clone())
            .await
            .expect("failed to connect to NATS"),
    );

    let metrics = Metrics::new().expect("failed to create metrics");
    let engine = Arc::new(InventoryService::new(
        store.clone(),
        producer.clone(),
        config.provision.clone(),
        config.service.reservation_timeout_minutes,
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = EventConsumer::connect(&config.nats, engine.clone(), producer.clone())
        .await
        .expect("failed to create event consumer");
    let consumer_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            if let Err(err) = consumer.run(shutdown_rx).await {
                error!(error = %err, "event consumer failed");
            }
        }
    });

    let sweeper = ExpirySweeper::new(
        engine.clone(),
        config.service.health_check_interval_secs,
        config.service.event_dedup_retention_hours,
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx.clone()));

    let grpc_addr = format!("{}:{}", config.grpc.host, config.grpc.port)
        .to_socket_addrs()
        .expect("invalid gRPC address")
        .next()
        .expect("gRPC address did not resolve");
    let grpc_service = InventoryGrpcServer::new(engine.clone()).into_service();
    let grpc_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_rx.clone();
        async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(err) = tonic::transport::Server::builder()
                .add_service(grpc_service)
                .serve_with_shutdown(grpc_addr, shutdown)
                .await
            {
                error!(error = %err, "gRPC server failed");
            }
        }
    });

    let engine_data = web::Data::new(engine.clone());
    let metrics_data = web::Data::new(metrics.clone());
    let server = HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(engine_data.clone())
            .app_data(metrics_data.clone())
            .configure(handlers::configure_routes)
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .shutdown_timeout(config.service.shutdown_grace_secs)
    .disable_signals()
    .run();

    let server_handle = server.handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for shutdown signal");
        info!("shutdown signal received, draining");
        let _ = shutdown_tx.send(true);
        server_handle.stop(true).await;
    });

    info!("all services started");
    server.await?;

    let grace = Duration::from_secs(config.service.shutdown_grace_secs);
    let drain = async {
        let _ = consumer_handle.await;
        let _ = sweeper_handle.await;
        let _ = grpc_handle.await;
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!("timed out waiting for background tasks to stop");
    }
    if let Err(err) = producer.flush().await {
        warn!(error = %err, "failed to flush producer on shutdown");
    }

    info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "console" {
        builder.init();
    } else {
        builder.json().init();
    }
}
