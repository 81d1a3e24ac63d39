use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};
use uuid::Uuid;

use crate::errors::Error;
use crate::ingest::Ingestion;
use crate::model::{PageRequest, PagedResult, TelemetryReading, TelemetrySubmission};
use crate::store::TelemetryStore;

const DEFAULT_PAGE: i64 = 1;
const DEFAULT_PAGE_SIZE: i64 = 20;
const DEFAULT_LATEST: i64 = 10;
const MAX_LATEST: i64 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub ingestion: Arc<Ingestion>,
    pub store: Arc<dyn TelemetryStore>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    page: Option<i64>,
    page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LatestQuery {
    count: Option<i64>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/telemetry", post(submit_telemetry))
        .route("/api/telemetry/latest", get(get_latest))
        .route("/api/telemetry/:device_id", get(get_by_device))
        .route("/api/telemetry/:device_id/paged", get(get_paged))
        .with_state(state)
}

async fn submit_telemetry(
    State(state): State<AppState>,
    body: Result<Json<TelemetrySubmission>, JsonRejection>,
) -> Result<StatusCode, AppError> {
    let Json(submission) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!("Rejected telemetry body: {}", rejection.body_text());
            return Err(AppError::BadRequest(rejection.body_text()));
        }
    };

    state.ingestion.submit(&submission).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_by_device(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<Vec<TelemetryReading>>, AppError> {
    let readings = state.store.list_by_device(device_id).await?;
    Ok(Json(readings))
}

async fn get_paged(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
    Query(params): Query<PageQuery>,
) -> Result<Json<PagedResult<TelemetryReading>>, AppError> {
    let request = PageRequest::new(
        params.page.unwrap_or(DEFAULT_PAGE),
        params.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
    )?;
    let page = state.store.page(device_id, request).await?;
    Ok(Json(page))
}

async fn get_latest(
    State(state): State<AppState>,
    Query(params): Query<LatestQuery>,
) -> Result<Json<Vec<TelemetryReading>>, AppError> {
    let count = params.count.unwrap_or(DEFAULT_LATEST).clamp(1, MAX_LATEST) as u32;
    let readings = state.store.latest(count).await?;
    Ok(Json(readings))
}

pub enum AppError {
    Domain(Error),
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = match self {
            AppError::BadRequest(message) => {
                return (StatusCode::BAD_REQUEST, message).into_response();
            }
            AppError::Domain(err) => err,
        };

        match err {
            Error::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "errors": errors })),
            )
                .into_response(),
            Error::DeviceNotFound(_) => {
                (StatusCode::BAD_REQUEST, "Device not found").into_response()
            }
            Error::InvalidPage { .. } => (
                StatusCode::BAD_REQUEST,
                "Page and page size must be greater than 0",
            )
                .into_response(),
            err if err.is_transport() => {
                error!("Message channel unavailable: {}", err);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable",
                )
                    .into_response()
            }
            err => {
                error!("API error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

impl<E> From<E> for AppError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self::Domain(err.into())
    }
}
