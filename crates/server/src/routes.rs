use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};
use tracing::info;

use cartwheel_agent::orchestrator::Orchestrator;
use cartwheel_core::domain::chat::ChatRequest;
use cartwheel_core::errors::InterfaceError;

#[derive(Clone)]
pub struct ChatState {
    engine: Arc<Orchestrator>,
}

pub fn router(engine: Arc<Orchestrator>) -> Router {
    Router::new().route("/chat", post(chat)).with_state(ChatState { engine })
}

pub async fn chat(
    State(state): State<ChatState>,
    Json(request): Json<ChatRequest>,
) -> (StatusCode, Json<Value>) {
    match state.engine.handle(request).await {
        Ok(reply) => {
            let payload = serde_json::to_value(&reply).unwrap_or_else(|_| json!({}));
            (StatusCode::OK, Json(payload))
        }
        Err(error) => {
            info!(
                event_name = "server.chat.rejected",
                correlation_id = error.correlation_id(),
                reason = %error,
                "chat request rejected"
            );
            let payload = json!({
                "error": error.user_message(),
                "reason": error.to_string(),
            });
            (status_for(&error), Json(payload))
        }
    }
}

/// Rate-limit rejections get 429 so clients back off; content rejections get
/// 400 so clients reword instead.
fn status_for(error: &InterfaceError) -> StatusCode {
    match error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        InterfaceError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
