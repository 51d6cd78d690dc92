pub mod queries;

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Open the job status pool. Sized for one connection per in-flight job plus
/// headroom for the HTTP routes.
pub async fn init_pool(database_url: &str, max_in_flight: usize) -> Result<PgPool, sqlx::Error> {
    let max_connections = u32::try_from(max_in_flight)
        .unwrap_or(u32::MAX)
        .saturating_add(5);

    PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Create `processing_jobs` if needed.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Pool plus migrations, as both binaries need on startup.
pub async fn connect(database_url: &str, max_in_flight: usize) -> Result<PgPool, sqlx::Error> {
    let pool = init_pool(database_url, max_in_flight).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}
