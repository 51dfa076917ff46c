//! Bot Framework messaging endpoint.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, header::AUTHORIZATION},
};
use serde_json::{Value, json};

use crate::clients::bot_framework::Activity;
use crate::error::{ApiError, unauthorized};
use crate::server::AppState;
use crate::services::teams::handle_activity;

/// Receives a Bot Framework activity
///
/// The bearer token is verified before the activity is read. Replies are sent
/// from a background task, so the channel always gets an immediate 200.
#[utoipa::path(
    post,
    path = "/api/v1/teams/messages",
    request_body(content = Object, description = "Bot Framework activity"),
    responses(
        (status = 200, description = "Activity accepted"),
        (status = 401, description = "Bot Framework token rejected", body = ApiError)
    ),
    tag = "teams"
)]
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if let Err(e) = state.bot.verify(authorization).await {
        tracing::warn!(error = %e, "Rejected Bot Framework request");
        return Err(unauthorized(Some("Invalid Bot Framework token")));
    }

    let activity: Activity = match serde_json::from_slice(&body) {
        Ok(activity) => activity,
        Err(e) => {
            tracing::error!(error = %e, "Error processing Teams message");
            return Ok(Json(
                json!({ "status": "error", "message": "Internal Server Error" }),
            ));
        }
    };
    tracing::info!(kind = %activity.kind, "Received Teams activity");

    let bot = Arc::clone(&state.bot);
    tokio::spawn(async move {
        if let Err(e) = handle_activity(bot.as_ref(), &activity).await {
            tracing::error!(error = %e, "Error handling Teams activity");
        }
    });
    Ok(Json(json!({})))
}
