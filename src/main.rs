use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use pixelpipe::{
    app_state::AppState,
    config::AppConfig,
    db, routes,
    services::{
        pipeline::PipelineOrchestrator, queue::RedisJobQueue, status::PgStatusStore,
        storage::S3ObjectStore,
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing pixelpipe server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe();

    // Job status store
    tracing::info!("Connecting to PostgreSQL and running migrations");
    let db_pool = db::connect(&config.database_url, config.max_in_flight)
        .await
        .expect("Failed to connect to database");
    let status = Arc::new(PgStatusStore::new(db_pool));

    tracing::info!(bucket = %config.s3_bucket, "Initializing object storage client");
    let store = S3ObjectStore::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object storage client");

    // The server only pings the queue for /health; it never consumes.
    tracing::info!("Connecting to Redis job queue");
    let queue = RedisJobQueue::connect(&config.redis_url, &config.queue_name, &config.consumer_name)
        .await
        .expect("Failed to connect to Redis");

    let orchestrator = PipelineOrchestrator::from_config(&config, Arc::new(store), status)
        .expect("Failed to initialize pipeline");

    let state = AppState::new(
        Arc::new(orchestrator),
        Arc::new(queue),
        config.stats_sample_limit,
    );

    let app = routes::router(state, prometheus_handle, config.request_body_limit_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
