use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use craftdock_common::Error;
use craftdock_core::registry::AccountId;
use craftdock_core::{Command, Subscription};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    events_path, AccountCreated, ActionAccepted, ApiError, AppState, CreateAccountRequest,
    CreateServerRequest, ErrorBody, SecretRotated, ServerCreated,
};

/// Owner identity arrives as a header set by the auth proxy in front of us.
const OWNER_HEADER: &str = "x-account-id";

fn owner_from_headers(headers: &HeaderMap) -> Result<AccountId, ApiError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<AccountId>().ok())
        .ok_or_else(|| {
            ApiError(Error::Validation(format!(
                "missing or malformed {OWNER_HEADER} header"
            )))
        })
}

pub(crate) async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "craftdock-gateway",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub(crate) async fn create_account_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateAccountRequest>,
) -> Result<Response, ApiError> {
    let account = state
        .registry
        .create_account(&req.email, &req.password_hash)
        .await?;
    info!(email = %account.email, "Account created");
    Ok((
        StatusCode::CREATED,
        Json(AccountCreated {
            id: account.id,
            email: account.email,
        }),
    )
        .into_response())
}

pub(crate) async fn create_server_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateServerRequest>,
) -> Result<Response, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let record = state.supervisor.create(owner, &req.name, req.memory_mb).await?;
    Ok((
        StatusCode::CREATED,
        Json(ServerCreated {
            id: record.id,
            events: events_path(&record.name),
            name: record.name,
            memory_mb: record.memory_mb,
            rcon_secret: record.rcon_secret,
        }),
    )
        .into_response())
}

pub(crate) async fn list_servers_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let view = state.reconciler.reconcile_for_owner(owner).await?;
    Ok(Json(view).into_response())
}

pub(crate) async fn server_action_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, action)): Path<(i64, String)>,
) -> Result<Response, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let command = match action.as_str() {
        "start" => Command::Start,
        "stop" => Command::Stop,
        "restart" => Command::Restart,
        other => {
            return Err(ApiError(Error::NotFound(format!(
                "unknown action {other}"
            ))))
        }
    };
    let record = state.supervisor.dispatch(owner, id, command).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ActionAccepted {
            status: "accepted".to_string(),
            events: events_path(&record.name),
        }),
    )
        .into_response())
}

pub(crate) async fn delete_server_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let owner = owner_from_headers(&headers)?;
    match state.supervisor.dispatch(owner, id, Command::Delete).await {
        Ok(_) => Ok(StatusCode::NO_CONTENT.into_response()),
        // A container that refuses to die leaves the record in place; the
        // caller can retry once the runtime recovers.
        Err(e @ Error::Runtime(_)) => Ok((
            StatusCode::CONFLICT,
            Json(ErrorBody {
                error: e.to_string(),
            }),
        )
            .into_response()),
        Err(e) => Err(ApiError(e)),
    }
}

pub(crate) async fn rotate_secret_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let owner = owner_from_headers(&headers)?;
    let record = state.registry.regenerate_secret(id, owner).await?;
    info!(name = %record.name, "Control secret rotated");
    Ok(Json(SecretRotated {
        id: record.id,
        rcon_secret: record.rcon_secret,
    })
    .into_response())
}

/// WebSocket feed of one server's log lines and status transitions. Ownership
/// is checked before the upgrade so strangers get a 404, not a socket.
pub(crate) async fn server_events_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let owner = owner_from_headers(&headers)?;
    state.registry.get_by_name(&name, owner).await?;
    let subscription = state.hub.subscribe(&name);
    Ok(ws.on_upgrade(move |socket| forward_events(socket, subscription)))
}

async fn forward_events(mut socket: WebSocket, mut subscription: Subscription) {
    let name = subscription.server_name().to_string();
    debug!(%name, "Event socket opened");
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(%name, error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Inbound frames are ignored; this feed is one-way.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(%name, "Event socket closed");
    // Dropping the subscription releases the log tail if we were the last
    // listener.
}
