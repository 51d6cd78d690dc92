use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use pixelpipe::{
    config::AppConfig,
    db, routes,
    services::{
        consumer::MessageConsumer, pipeline::PipelineOrchestrator, queue::RedisJobQueue,
        status::PgStatusStore, storage::S3ObjectStore,
    },
};

const QUEUE_DEPTH_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting pixelpipe worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Metrics scrape listener
    let metrics_addr: SocketAddr = config
        .metrics_bind_addr
        .parse()
        .expect("Invalid METRICS_BIND_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    routes::metrics::describe();
    tracing::info!(addr = %metrics_addr, "Metrics listener started");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::connect(&config.database_url, config.max_in_flight)
        .await
        .expect("Failed to connect to database");
    let status = Arc::new(PgStatusStore::new(db_pool));

    let store = S3ObjectStore::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object storage client");

    tracing::info!(
        queue = %config.queue_name,
        consumer = %config.consumer_name,
        "Connecting to Redis job queue"
    );
    let queue = Arc::new(
        RedisJobQueue::connect(&config.redis_url, &config.queue_name, &config.consumer_name)
            .await
            .expect("Failed to connect to Redis"),
    );

    // Messages this consumer held when it last stopped go back to pending.
    match queue.recover_in_flight().await {
        Ok(0) => {}
        Ok(recovered) => {
            tracing::warn!(recovered, "Requeued messages left in flight by a previous run")
        }
        Err(e) => tracing::error!(error = %e, "Failed to recover in-flight messages"),
    }

    let orchestrator = Arc::new(
        PipelineOrchestrator::from_config(&config, Arc::new(store), status)
            .expect("Failed to initialize pipeline"),
    );

    let consumer = Arc::new(MessageConsumer::new(
        queue.clone(),
        orchestrator,
        config.consumer_config(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let depth_queue = queue.clone();
    let mut depth_shutdown = shutdown_rx.clone();
    let depth_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(QUEUE_DEPTH_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match depth_queue.queue_depth().await {
                        Ok(depth) => metrics::gauge!("pixelpipe_queue_depth").set(depth as f64),
                        Err(e) => tracing::debug!(error = %e, "Failed to read queue depth"),
                    }
                }
                _ = depth_shutdown.changed() => break,
            }
        }
    });

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            // Keep the sender alive so the consumer keeps running.
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!("Worker ready, starting job processing loop");
    consumer.run(shutdown_rx).await;

    depth_task.abort();
    tracing::info!("Worker stopped");
}
