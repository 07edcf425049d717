//! HTTP/WebSocket surface of the control plane.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use craftdock_common::Error;
use craftdock_core::{ControlSupervisor, EventHub, Reconciler, ServerRegistry};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

mod routes;


#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ServerRegistry>,
    pub reconciler: Arc<Reconciler>,
    pub supervisor: Arc<ControlSupervisor>,
    pub hub: Arc<EventHub>,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/accounts", post(routes::create_account_handler))
        .route("/servers", post(routes::create_server_handler))
        .route("/servers", get(routes::list_servers_handler))
        .route(
            "/servers/:id/actions/:action",
            post(routes::server_action_handler),
        )
        .route("/servers/:id", delete(routes::delete_server_handler))
        .route("/servers/:id/secret", post(routes::rotate_secret_handler))
        // Per-server push channel for log and status events
        .route("/servers/:name/events", get(routes::server_events_handler))
        .route("/health", get(routes::health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// Main request/response types

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateAccountRequest {
    pub email: String,
    /// Produced by the identity layer; stored opaquely.
    pub password_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountCreated {
    pub id: i64,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub memory_mb: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerCreated {
    pub id: i64,
    pub name: String,
    pub memory_mb: u32,
    /// Returned on creation and rotation only; never listed afterwards.
    pub rcon_secret: String,
    pub events: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionAccepted {
    pub status: String,
    pub events: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SecretRotated {
    pub id: i64,
    pub rcon_secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn events_path(name: &str) -> String {
    format!("/servers/{name}/events")
}

/// Boundary wrapper turning the shared error taxonomy into HTTP responses.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, self.0.to_string()),
            Error::DuplicateName(_) | Error::Conflict(_) => {
                (StatusCode::CONFLICT, self.0.to_string())
            }
            Error::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            Error::Runtime(_) => (StatusCode::BAD_GATEWAY, self.0.to_string()),
            Error::Storage(e) => {
                error!(error = %e, "Storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal storage error".to_string(),
                )
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}
