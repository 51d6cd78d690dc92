use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::result::ProcessingResult;
use crate::routes::{api_error, ApiError};
use crate::services::decoder::decode_job_value;

/// POST /process: run one job synchronously and return its full result.
///
/// Stage and validation failures are reported inside the result, not as HTTP
/// errors. Only a body that is not a JSON object is rejected.
pub async fn process_image(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ProcessingResult>, ApiError> {
    let mut payload = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "request body must be a JSON object",
            ))
        }
        Err(e) => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("invalid JSON body: {e}"),
            ))
        }
    };

    fill_identifier(&mut payload, "job_id");
    fill_identifier(&mut payload, "image_id");

    let job_id = string_field(&payload, "job_id");
    let image_id = string_field(&payload, "image_id");
    let url = string_field(&payload, "url");

    match decode_job_value(Value::Object(payload)) {
        Ok(decoded) => {
            let outcome = state.orchestrator.execute(&decoded).await;
            Ok(Json(outcome.result))
        }
        Err(rejection) => {
            tracing::warn!(job_id = %job_id, error = %rejection, "Rejected synchronous job");
            Ok(Json(ProcessingResult::rejected(
                &job_id,
                &image_id,
                &url,
                rejection.to_string(),
            )))
        }
    }
}

/// Generate a UUIDv4 for an identifier the caller left out.
fn fill_identifier(payload: &mut Map<String, Value>, field: &str) {
    if payload.get(field).map_or(true, Value::is_null) {
        payload.insert(field.to_string(), Value::String(Uuid::new_v4().to_string()));
    }
}

fn string_field(payload: &Map<String, Value>, field: &str) -> String {
    payload
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
