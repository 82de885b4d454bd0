//! HTTP surface: health, backend lifecycle triggers and the setup gate.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use ultra_protocol::SupervisorSnapshot;

use crate::state::AppState;
use crate::supervisor::SupervisorError;
use crate::websocket::ws_handler;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/backend", get(backend_status))
        .route("/backend/start", post(start_backend))
        .route("/backend/restart", post(restart_backend))
        .route("/backend/stop", post(stop_backend))
        .route("/setup/complete", post(complete_setup))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// JSON error body with the same codes the WebSocket `error` event uses
pub struct ApiError(SupervisorError);

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SupervisorError::AlreadyActive(_) | SupervisorError::NotRunning => {
                StatusCode::CONFLICT
            }
            SupervisorError::BackendUnavailable(_)
            | SupervisorError::Input(_)
            | SupervisorError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = serde_json::json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type SnapshotResult = Result<Json<SupervisorSnapshot>, ApiError>;

fn snapshot_json(state: &AppState) -> Json<SupervisorSnapshot> {
    Json(state.supervisor.snapshot().as_ref().clone())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn backend_status(State(state): State<Arc<AppState>>) -> Json<SupervisorSnapshot> {
    snapshot_json(&state)
}

async fn start_backend(State(state): State<Arc<AppState>>) -> SnapshotResult {
    state.supervisor.start().await?;
    Ok(snapshot_json(&state))
}

async fn restart_backend(State(state): State<Arc<AppState>>) -> SnapshotResult {
    state.supervisor.restart().await?;
    Ok(snapshot_json(&state))
}

async fn stop_backend(State(state): State<Arc<AppState>>) -> SnapshotResult {
    state.supervisor.stop().await?;
    Ok(snapshot_json(&state))
}

async fn complete_setup(State(state): State<Arc<AppState>>) -> SnapshotResult {
    state.complete_setup().await?;
    Ok(snapshot_json(&state))
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use ultra_backend::LaunchSpec;
    use ultra_protocol::SupervisorState;

    use crate::test_support::{serve, TestServer};

    fn sleeper() -> LaunchSpec {
        LaunchSpec::new("sleep", ["30"])
    }

    async fn post(addr: std::net::SocketAddr, path: &str) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("http://{addr}{path}"))
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let TestServer { addr, .. } = serve(sleeper(), false).await;
        let body = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn lifecycle_endpoints_drive_the_supervisor() {
        let TestServer { addr, state } = serve(sleeper(), false).await;

        let idle: serde_json::Value = reqwest::get(format!("http://{addr}/backend"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(idle["state"], "idle");

        let started = post(addr, "/backend/start").await;
        assert_eq!(started.status(), reqwest::StatusCode::OK);
        let snapshot: serde_json::Value = started.json().await.unwrap();
        assert_eq!(snapshot["state"], "running");
        assert!(snapshot["pid"].is_u64());

        let again = post(addr, "/backend/start").await;
        assert_eq!(again.status(), reqwest::StatusCode::CONFLICT);
        let body: serde_json::Value = again.json().await.unwrap();
        assert_eq!(body["code"], "already_active");

        let stopped = post(addr, "/backend/stop").await;
        assert_eq!(stopped.status(), reqwest::StatusCode::OK);
        assert!(
            state
                .supervisor
                .wait_for_state(SupervisorState::Idle, Duration::from_secs(5))
                .await
        );
    }

    #[tokio::test]
    async fn setup_complete_clears_gate_and_starts_backend() {
        let TestServer { addr, state } = serve(sleeper(), true).await;
        assert!(state.setup_pending());

        let response = post(addr, "/setup/complete").await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(!state.setup_pending());
        assert_eq!(state.supervisor.snapshot().state, SupervisorState::Running);

        // Completing twice is harmless.
        let response = post(addr, "/setup/complete").await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        state.supervisor.shutdown(Duration::from_secs(5)).await;
    }
}
