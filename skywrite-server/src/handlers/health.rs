//! Component-by-component health probe.

use axum::{Json, extract::State};
use serde_json::json;

use crate::infra::app_state::AppState;

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .is_ok();

    let dispatcher = state.dispatcher.health();
    let gates: Vec<_> = state
        .gate
        .snapshot()
        .into_iter()
        .map(|gate| {
            json!({
                "endpoint": gate.endpoint,
                "used": gate.used,
                "max": gate.max,
                "resetsInSecs": gate.resets_in.as_secs(),
            })
        })
        .collect();

    let healthy = database_ok && dispatcher.tick_task_alive;
    Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "components": {
            "database": {
                "status": if database_ok { "ok" } else { "down" },
            },
            "dispatcher": {
                "status": if dispatcher.tick_task_alive { "ok" } else { "down" },
                "tickInProgress": dispatcher.tick_in_progress,
                "lastTickAt": dispatcher.last_tick_at,
            },
            "rateGate": gates,
        },
    }))
}
