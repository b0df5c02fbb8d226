//! Liveness endpoint. Also reports whether queueing is possible at all.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let broker = if state.emails.broker_configured() {
        "configured"
    } else {
        "absent"
    };

    Json(json!({
        "status": "ok",
        "service": "postbox-api",
        "version": env!("CARGO_PKG_VERSION"),
        "broker": broker,
        "topic": state.emails.topic(),
    }))
}
