use std::path::PathBuf;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::MetashopError;
use crate::index::lifecycle::CoordinatorStatus;
use crate::server::AdminState;

use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct BuildIndexRequest {
    pub products_file: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub operation: &'static str,
}

pub async fn index_status(State(state): State<AdminState>) -> Json<CoordinatorStatus> {
    Json(state.coordinator.status())
}

/// Reserve the rebuild slot, then catalogue and rebuild in the background.
pub async fn build_index(
    State(state): State<AdminState>,
    Json(req): Json<BuildIndexRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    if !req.products_file.is_file() {
        return Err(MetashopError::Validation(format!(
            "products file '{}' does not exist",
            req.products_file.display()
        ))
        .into());
    }
    let ticket = state.coordinator.begin_build()?;

    let builder = state.builder.clone();
    tokio::spawn(async move {
        match builder.build_from_file_with(ticket, &req.products_file).await {
            Ok(report) => info!(
                added = report.added.len(),
                failed = report.failed.len(),
                snapshot_id = ?report.snapshot_id,
                "background build finished"
            ),
            Err(e) => warn!(error = %e, "background build failed"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            operation: "build",
        }),
    ))
}

pub async fn reindex(
    State(state): State<AdminState>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let ticket = state.coordinator.begin_build()?;

    let builder = state.builder.clone();
    tokio::spawn(async move {
        match builder.reindex_with(ticket).await {
            Ok(report) => info!(
                training_entries = report.training_entries,
                snapshot_id = ?report.snapshot_id,
                "background reindex finished"
            ),
            Err(e) => warn!(error = %e, "background reindex failed"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            operation: "reindex",
        }),
    ))
}
