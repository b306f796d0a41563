//! Survey fan-out route.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use feedback_notifier::survey::{ChannelFanout, SurveyNotification, enqueue_survey_notifications};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/surveys/notify", post(notify_survey))
}

#[derive(Debug, Serialize)]
pub struct SurveyNotifyResponse {
    pub survey_ref: String,
    pub results: Vec<ChannelFanout>,
}

/// POST /api/surveys/notify: Queue one job per enabled channel of the owner.
///
/// Always 202: per-channel failures are reported in `results`, never as an
/// error status, so the submitting request is not affected.
async fn notify_survey(
    State(state): State<AppState>,
    Json(body): Json<SurveyNotification>,
) -> (StatusCode, Json<SurveyNotifyResponse>) {
    let results = enqueue_survey_notifications(&state.queue, state.config.max_retries, &body).await;
    (
        StatusCode::ACCEPTED,
        Json(SurveyNotifyResponse {
            survey_ref: body.survey_ref,
            results,
        }),
    )
}
