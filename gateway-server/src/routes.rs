//! HTTP status endpoints (SPEC_FULL.md §6 "(NEW) HTTP status endpoints").
//!
//! Grounded on the teacher's `enlist_handler`/`reload_handler` text
//! endpoints in `relay-server/src/main.rs`, generalized to JSON since this
//! gateway already speaks JSON on the wire.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::AppState;

pub async fn games_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list_games().await)
}

pub async fn healthz_handler() -> impl IntoResponse {
    "OK"
}
