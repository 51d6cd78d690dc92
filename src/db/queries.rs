use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::models::job::{JobDescriptor, JobStatus};
use crate::models::result::ProcessingResult;

/// A row of `processing_jobs`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub image_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub status: JobStatus,
    pub retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ProcessingResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counts by status over a sample of recently updated jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub total_jobs: i64,
    pub queued: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Upsert a job into `processing`. The previous result, if any, is kept until
/// the new terminal record replaces it.
pub async fn mark_processing(pool: &PgPool, job: &JobDescriptor) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO processing_jobs (job_id, image_id, batch_id, status, retry_count)
        VALUES ($1, $2, $3, 'processing', $4)
        ON CONFLICT (job_id) DO UPDATE
        SET status = 'processing',
            image_id = EXCLUDED.image_id,
            batch_id = COALESCE(EXCLUDED.batch_id, processing_jobs.batch_id),
            retry_count = EXCLUDED.retry_count,
            updated_at = NOW()
        "#,
    )
    .bind(&job.job_id)
    .bind(&job.image_id)
    .bind(&job.batch_id)
    .bind(i32::try_from(job.retry_count).unwrap_or(i32::MAX))
    .execute(pool)
    .await?;

    Ok(())
}

/// Store the terminal status and full result of a job.
pub async fn record_terminal(pool: &PgPool, result: &ProcessingResult) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO processing_jobs (job_id, image_id, status, result)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (job_id) DO UPDATE
        SET status = EXCLUDED.status,
            result = EXCLUDED.result,
            updated_at = NOW()
        "#,
    )
    .bind(&result.job_id)
    .bind(&result.image_id)
    .bind(result.status.as_ref())
    .bind(Json(result))
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: &str) -> Result<Option<JobRecord>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT job_id, image_id, batch_id, status, retry_count, result, created_at, updated_at
        FROM processing_jobs
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    let Some(r) = row else {
        return Ok(None);
    };

    let status_str: String = r.try_get("status")?;
    let result: Option<Json<ProcessingResult>> = r.try_get("result")?;

    Ok(Some(JobRecord {
        job_id: r.try_get("job_id")?,
        image_id: r.try_get("image_id")?,
        batch_id: r.try_get("batch_id")?,
        status: JobStatus::from_str(&status_str).unwrap_or_default(),
        retry_count: r.try_get("retry_count")?,
        result: result.map(|Json(result)| result),
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    }))
}

/// Aggregate status counts over the `limit` most recently updated jobs.
pub async fn status_counts(pool: &PgPool, limit: i64) -> Result<StatusCounts, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS total_jobs,
               COUNT(*) FILTER (WHERE status = 'queued') AS queued,
               COUNT(*) FILTER (WHERE status = 'processing') AS processing,
               COUNT(*) FILTER (WHERE status = 'completed') AS completed,
               COUNT(*) FILTER (WHERE status = 'failed') AS failed
        FROM (
            SELECT status FROM processing_jobs
            ORDER BY updated_at DESC
            LIMIT $1
        ) recent
        "#,
    )
    .bind(limit)
    .fetch_one(pool)
    .await?;

    Ok(StatusCounts {
        total_jobs: row.try_get("total_jobs")?,
        queued: row.try_get("queued")?,
        processing: row.try_get("processing")?,
        completed: row.try_get("completed")?,
        failed: row.try_get("failed")?,
    })
}

pub async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
