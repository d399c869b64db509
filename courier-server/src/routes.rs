//! Route definitions for the Courier server.
//!
//! Session CRUD plus the streaming chat endpoint.

use crate::relay::relay;
use crate::store::{Session, SessionStore, StoredMessage};
use crate::upstream::{ChatMessage, Upstream, UpstreamConfig};
use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use courier_common::error::Error;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub upstream: Arc<dyn Upstream>,
}

/// Chat request body.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub config: UpstreamConfig,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

/// Session creation body.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Generic success response.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    fn success() -> Json<Self> {
        Json(Self {
            status: "success".to_string(),
        })
    }
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: Error) -> ApiError {
    (
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code().to_string(),
        }),
    )
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/api/sessions", get(list_sessions_handler).post(create_session_handler))
        .route("/api/sessions/:session_id", axum::routing::delete(delete_session_handler))
        .route("/api/messages/:session_id", get(list_messages_handler))
        .route("/api/chat", post(chat_handler))
        .with_state(state)
}

/// Static front-end entry point.
async fn index_handler() -> Html<&'static str> {
    Html(include_str!("../assets/index.html"))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "courier-server".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_sessions_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<Session>>, ApiError> {
    state.store.list_sessions().map(Json).map_err(api_error)
}

async fn create_session_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    state
        .store
        .create_session(&request.id, request.title.as_deref())
        .map_err(api_error)?;

    tracing::info!(session_id = %request.id, "Session created");
    Ok(StatusResponse::success())
}

async fn delete_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let removed = state
        .store
        .delete_session(&session_id)
        .map_err(api_error)?;

    tracing::info!(session_id = %session_id, removed = removed, "Session deleted");
    Ok(StatusResponse::success())
}

async fn list_messages_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    state
        .store
        .list_messages(&session_id)
        .map(Json)
        .map_err(api_error)
}

/// The chat relay endpoint.
///
/// Validation happens before any upstream or storage call; once the stream
/// starts, failures surface as in-stream events rather than HTTP errors.
async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if request.messages.is_empty() {
        return api_error(Error::InvalidInput("messages must not be empty".into()))
            .into_response();
    }

    let events = relay(
        state.store.clone(),
        state.upstream.clone(),
        request.messages,
        request.config,
        request.session_id,
    );

    let body = Body::from_stream(
        events.map(|event| Ok::<_, Infallible>(Bytes::from(event.to_sse()))),
    );

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}
