use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use cartwheel_agent::health::{HealthMonitor, HealthSnapshot, HealthStatus};

#[derive(Clone)]
pub struct HealthState {
    monitor: Arc<HealthMonitor>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub checked_at: String,
    pub last_latency_ms: u64,
    pub error_rate: f64,
    pub cache_hit_rate: f64,
}

impl From<HealthSnapshot> for HealthResponse {
    fn from(snapshot: HealthSnapshot) -> Self {
        Self {
            status: snapshot.status.as_str(),
            checked_at: snapshot.checked_at.to_rfc3339(),
            last_latency_ms: snapshot.last_latency_ms,
            error_rate: snapshot.error_rate,
            cache_hit_rate: snapshot.cache_hit_rate,
        }
    }
}

pub fn router(monitor: Arc<HealthMonitor>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { monitor })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = state.monitor.snapshot();
    let status_code = match snapshot.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(HealthResponse::from(snapshot)))
}
