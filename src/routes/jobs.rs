use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::routes::{api_error, ApiError};
use crate::services::status::JobRecord;

/// GET /jobs/{job_id}: persisted status record of a queued job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    match state.status.get_job(&job_id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(api_error(
            StatusCode::NOT_FOUND,
            format!("job {job_id} not found"),
        )),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("status store unavailable: {e}"),
            ))
        }
    }
}
