use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::routes::{api_error, ApiError};
use crate::services::status::StatusCounts;

#[derive(Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub counts: StatusCounts,
    /// Most recently updated jobs the counts were taken over.
    pub sample_limit: i64,
}

/// GET /stats: job counts by status over a recent sample.
pub async fn job_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let counts = state
        .status
        .status_counts(state.stats_sample_limit)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to load job stats");
            api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("status store unavailable: {e}"),
            )
        })?;

    Ok(Json(StatsResponse {
        counts,
        sample_limit: state.stats_sample_limit,
    }))
}
