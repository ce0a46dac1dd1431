//! REST API under `/api/terminal-pty`.
//!
//! Session management without a live terminal: create, list, resize and
//! destroy sessions, plus admin statistics. Sessions created here run
//! detached until a WebSocket client attaches.

use std::path::PathBuf;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use protocol::{ErrorCode, SessionDescriptor, DEFAULT_COLS, DEFAULT_ROWS};
use serde::{Deserialize, Serialize};

use super::auth::{require_admin, AuthError, RequireIdentity};
use super::AppState;
use crate::session::{CreateOptions, RegistryStats, SessionError};

/// Body of `POST /create`.
#[derive(Debug, Default, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Body of `POST /resize`.
#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    success: bool,
    session: SessionDescriptor,
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    success: bool,
    sessions: Vec<SessionDescriptor>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    success: bool,
    stats: RegistryStats,
}

/// Error response for the REST API.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    success: bool,
    error: String,
    code: ErrorCode,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: ErrorCode::InvalidRequest,
            message: message.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::LimitExceeded { .. } | SessionError::CapacityExhausted(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::WriteToDeadSession(_) => StatusCode::CONFLICT,
            SessionError::ResizeFailed(_) => StatusCode::BAD_REQUEST,
            SessionError::SpawnFailed(_) | SessionError::KillFailed(_) | SessionError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let (status, code) = match err {
            AuthError::Forbidden => (StatusCode::FORBIDDEN, ErrorCode::Forbidden),
            AuthError::MissingCredentials | AuthError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, ErrorCode::TransportAuthRequired)
            }
            AuthError::NotConfigured => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError),
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            success: false,
            error: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Builds the REST routes. Mount under `/api/terminal-pty`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/create", post(create_session))
        .route("/sessions", get(list_sessions).delete(destroy_all_sessions))
        .route("/resize", post(resize_session))
        .route("/session/:session_id", delete(destroy_session))
        .route("/stats", get(stats))
}

async fn create_session(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<AppState>,
    Json(request): Json<CreateRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state
        .registry
        .create(
            &identity.user_id,
            CreateOptions {
                cols: request.cols.unwrap_or(DEFAULT_COLS),
                rows: request.rows.unwrap_or(DEFAULT_ROWS),
                cwd: request.cwd.map(PathBuf::from),
            },
        )
        .await?;

    Ok(Json(SessionResponse {
        success: true,
        session: session.descriptor(),
    }))
}

async fn list_sessions(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<AppState>,
) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        success: true,
        sessions: state.registry.list(&identity.user_id),
    })
}

async fn resize_session(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<AppState>,
    Json(request): Json<ResizeRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    if request.session_id.is_empty() || request.cols == 0 || request.rows == 0 {
        return Err(ApiError::bad_request("session_id, cols and rows are required"));
    }

    let session = state
        .registry
        .get(&identity.user_id, &request.session_id)
        .ok_or_else(|| SessionError::NotFound(request.session_id.clone()))?;
    session.resize(request.cols, request.rows).await?;

    Ok(Json(MessageResponse {
        success: true,
        message: "terminal resized".to_string(),
    }))
}

async fn destroy_session(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    if !state.registry.destroy(&identity.user_id, &session_id).await {
        return Err(SessionError::NotFound(session_id).into());
    }

    Ok(Json(MessageResponse {
        success: true,
        message: "session destroyed".to_string(),
    }))
}

async fn destroy_all_sessions(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<AppState>,
) -> Json<MessageResponse> {
    let count = state.registry.destroy_all_for_owner(&identity.user_id).await;

    Json(MessageResponse {
        success: true,
        message: format!("{} sessions destroyed", count),
    })
}

async fn stats(
    RequireIdentity(identity): RequireIdentity,
    State(state): State<AppState>,
) -> Result<Json<StatsResponse>, ApiError> {
    require_admin(&identity)?;

    Ok(Json(StatsResponse {
        success: true,
        stats: state.registry.stats(),
    }))
}
