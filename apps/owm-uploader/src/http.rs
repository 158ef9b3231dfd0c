use crate::record::Record;
use crate::service::{ServiceStatus, UploadServices};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub services: Arc<UploadServices>,
}

/// A single archive record or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordsRequest {
    One(Record),
    Many(Vec<Record>),
}

#[derive(Debug, Serialize)]
struct RecordsResponse {
    accepted: u64,
    targets: usize,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: &'static str,
    targets: Vec<ServiceStatus>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        targets: state.services.statuses(),
    })
}

async fn post_records(
    State(state): State<HttpState>,
    Json(payload): Json<RecordsRequest>,
) -> Result<Json<RecordsResponse>, (StatusCode, String)> {
    if state.services.is_empty() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "no upload targets configured".to_string(),
        ));
    }
    let records = match payload {
        RecordsRequest::One(record) => vec![record],
        RecordsRequest::Many(records) => records,
    };

    let mut accepted = 0u64;
    for record in &records {
        if state.services.dispatch(record) > 0 {
            accepted += 1;
        }
    }
    tracing::debug!(received = records.len(), accepted, "queued archive records");

    Ok(Json(RecordsResponse {
        accepted,
        targets: state.services.len(),
    }))
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/records", post(post_records))
        .with_state(state)
}
