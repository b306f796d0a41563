//! Notification enqueue and lookup routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use feedback_common::error::AppError;
use feedback_common::types::{EnqueueOutcome, NewNotification, NotificationJob};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(enqueue_notification))
        .route("/api/notifications/{id}", get(get_notification))
}

/// POST /api/notifications: Queue a notification.
///
/// Returns 202 with `queued` for a new job, or `duplicate` with the existing
/// job's id when an active job already holds the same `dedup_key`.
async fn enqueue_notification(
    State(state): State<AppState>,
    Json(body): Json<NewNotification>,
) -> Result<(StatusCode, Json<EnqueueOutcome>), AppError> {
    let outcome = state.queue.enqueue(&body, state.config.max_retries).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

/// GET /api/notifications/{id}: Fetch a single job. Bot tokens are redacted.
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationJob>, AppError> {
    let mut job = state.queue.get(id).await?;
    if let Some(metadata) = job.metadata.as_object_mut()
        && metadata.contains_key("bot_token")
    {
        metadata.insert("bot_token".to_string(), "[redacted]".into());
    }
    Ok(Json(job))
}
