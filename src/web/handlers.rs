//! HTTP request handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;
use tracing::{error, info};

use crate::collector::delta::ReportRecord;
use crate::collector::{CollectError, StatementsCollector};

/// UTC capture instant, second precision.
pub(crate) const SNAPSHOT_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S +0000";

#[derive(Serialize)]
pub(crate) struct StatementsPayload {
    pub(crate) snapshot_datetime: String,
    pub(crate) data: Vec<ReportRecord>,
}

#[derive(Serialize)]
pub(crate) struct ErrorBody {
    error: String,
}

pub(crate) type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, error: String) -> ApiError {
    (status, Json(ErrorBody { error }))
}

pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

pub(crate) async fn handle_statements(
    State(collector): State<Arc<StatementsCollector>>,
) -> Result<Json<StatementsPayload>, ApiError> {
    // The refresh blocks on the database round trip.
    let result = tokio::task::spawn_blocking(move || collector.refresh())
        .await
        .map_err(|e| {
            error!(error = %e, "refresh task failed");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            )
        })?;

    match result {
        Ok(report) => {
            info!(records = report.data.len(), "statements refreshed");
            Ok(Json(StatementsPayload {
                snapshot_datetime: report
                    .captured_at
                    .format(SNAPSHOT_DATETIME_FORMAT)
                    .to_string(),
                data: report.data,
            }))
        }
        Err(e @ CollectError::ExtensionNotInstalled) => {
            Err(api_error(StatusCode::NOT_FOUND, e.to_string()))
        }
        Err(e @ CollectError::BackendUnavailable(_)) => {
            error!(error = %e, "refresh failed");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}
