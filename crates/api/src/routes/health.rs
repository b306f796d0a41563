//! Health check endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;

use feedback_common::error::AppError;
use feedback_common::types::HealthReport;
use feedback_notifier::health::assess_health;
use feedback_notifier::lock::read_heartbeat;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub service: &'static str,
    pub version: &'static str,
    #[serde(flatten)]
    pub report: HealthReport,
}

/// GET /health: Always 200 while the API can reach Postgres; the delivery
/// verdict is in `status`.
async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let stats = state.queue.stats().await?;

    let heartbeat = match read_heartbeat(&state.redis).await {
        Ok(heartbeat) => heartbeat,
        Err(e) => {
            tracing::warn!(error = %e, "Could not read worker heartbeat");
            None
        }
    };

    let report = assess_health(
        stats,
        state.config.smtp.is_some(),
        heartbeat,
        state.config.poll_interval(),
        Utc::now(),
    );

    Ok(Json(HealthResponse {
        service: "feedback-api",
        version: env!("CARGO_PKG_VERSION"),
        report,
    }))
}
