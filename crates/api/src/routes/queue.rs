//! Queue introspection.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use feedback_common::error::AppError;
use feedback_common::types::QueueStats;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/queue/stats", get(queue_stats))
}

/// GET /api/queue/stats: Counts by status, ready count and rolling success rate.
async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>, AppError> {
    Ok(Json(state.queue.stats().await?))
}
