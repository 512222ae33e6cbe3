//! Liveness probe, answered on every host.
//!
//! Reports the live site count and snapshot generation so an operator can tell
//! whether a SIGHUP reload took effect.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.router.registry().snapshot();
    Json(json!({
        "status": "ok",
        "sites": snapshot.len(),
        "generation": snapshot.generation(),
    }))
}
