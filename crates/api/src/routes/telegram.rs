//! Telegram bot setup helpers.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use feedback_common::error::AppError;
use feedback_notifier::sender::telegram::{BotInfo, GroupChat};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/telegram/validate", post(validate_token))
        .route("/api/telegram/groups", post(discover_groups))
}

#[derive(Debug, Deserialize)]
pub struct BotTokenRequest {
    pub bot_token: String,
}

impl BotTokenRequest {
    fn token(&self) -> Result<&str, AppError> {
        let token = self.bot_token.trim();
        if token.is_empty() {
            return Err(AppError::Validation("bot_token must not be empty".to_string()));
        }
        Ok(token)
    }
}

#[derive(Debug, Serialize)]
pub struct GroupsResponse {
    pub groups: Vec<GroupChat>,
}

/// POST /api/telegram/validate: Check a bot token with `getMe`.
async fn validate_token(
    State(state): State<AppState>,
    Json(body): Json<BotTokenRequest>,
) -> Result<Json<BotInfo>, AppError> {
    let bot = state.telegram.get_me(body.token()?).await?;
    tracing::info!(bot_id = bot.id, username = ?bot.username, "Telegram bot token validated");
    Ok(Json(bot))
}

/// POST /api/telegram/groups: List groups the bot has seen recent activity in.
async fn discover_groups(
    State(state): State<AppState>,
    Json(body): Json<BotTokenRequest>,
) -> Result<Json<GroupsResponse>, AppError> {
    let groups = state.telegram.discover_group_chats(body.token()?).await?;
    Ok(Json(GroupsResponse { groups }))
}
