//! Persistence of job lifecycle transitions.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::queries;
pub use crate::db::queries::{JobRecord, StatusCounts};
use crate::models::job::JobDescriptor;
use crate::models::result::ProcessingResult;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Status store unavailable: {0}")]
    Unavailable(String),
}

/// Records where each job is in its lifecycle.
#[async_trait]
pub trait JobStateTracker: Send + Sync {
    /// Non-terminal transition recorded when a queued job is picked up.
    async fn mark_processing(&self, job: &JobDescriptor) -> Result<(), StatusError>;

    /// Terminal transition; stores the full result.
    async fn record_terminal(&self, result: &ProcessingResult) -> Result<(), StatusError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StatusError>;

    async fn status_counts(&self, sample_limit: i64) -> Result<StatusCounts, StatusError>;

    async fn ping(&self) -> Result<(), StatusError>;
}

/// Postgres-backed tracker over the `processing_jobs` table.
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStateTracker for PgStatusStore {
    async fn mark_processing(&self, job: &JobDescriptor) -> Result<(), StatusError> {
        queries::mark_processing(&self.pool, job).await?;
        Ok(())
    }

    async fn record_terminal(&self, result: &ProcessingResult) -> Result<(), StatusError> {
        queries::record_terminal(&self.pool, result).await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StatusError> {
        Ok(queries::get_job(&self.pool, job_id).await?)
    }

    async fn status_counts(&self, sample_limit: i64) -> Result<StatusCounts, StatusError> {
        Ok(queries::status_counts(&self.pool, sample_limit).await?)
    }

    async fn ping(&self) -> Result<(), StatusError> {
        queries::ping(&self.pool).await?;
        Ok(())
    }
}
