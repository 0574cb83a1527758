use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
    pub connections: usize,
}

/// Health check used by uptime probes
pub async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>> {
    if state.router.is_shutting_down() {
        return Err(AppError::ServiceUnavailable("relay is shutting down".into()));
    }

    let stats = state.router.stats();
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: stats.sessions,
        connections: stats.connections,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::relay::Role;
    use axum::{http::StatusCode, response::IntoResponse};

    #[tokio::test]
    async fn test_health_reports_counts() {
        let state = AppState::new(AppConfig::default());
        let (source, _rx) = state.router.register(4).unwrap();
        state.router.bind(&source, Role::Source, "X").unwrap();

        let Json(body) = health_check(State(state.clone())).await.unwrap();
        assert_eq!(body.status, "ok");
        assert_eq!(body.sessions, 1);
        assert_eq!(body.connections, 1);
    }

    #[tokio::test]
    async fn test_health_unavailable_during_shutdown() {
        let state = AppState::new(AppConfig::default());
        state.router.shutdown();

        let response = health_check(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
