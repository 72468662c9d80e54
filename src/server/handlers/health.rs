use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::server::AdminState;

pub async fn health_check(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "index_loaded": state.coordinator.handle().is_loaded(),
    }))
}
