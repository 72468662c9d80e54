use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers::{health, index, metrics};
use super::AdminState;

pub fn build_router(state: AdminState) -> Router {
    let timeout = Duration::from_secs(state.config.admin.request_timeout_secs.max(1));
    Router::new()
        .route("/healthz", get(health::health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/v1/index", get(index::index_status))
        .route("/v1/index/build", post(index::build_index))
        .route("/v1/index/reindex", post(index::reindex))
        .layer(TimeoutLayer::new(timeout))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}
