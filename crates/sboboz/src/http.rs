//! HTTP surface: health check, API root, session lookup, JSON errors.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use sboboz_protocol::{PlayerId, SessionId};
use sboboz_session::{Session, SessionStore};
use serde::Serialize;
use tokio::time::Instant;
use tower_http::catch_panic::{CatchPanicLayer, ResponseForPanic};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ServerConfig;

/// State shared by every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub sessions: Arc<SessionStore>,
}

impl AppState {
    pub fn new(config: ServerConfig, sessions: Arc<SessionStore>) -> Self {
        Self {
            config: Arc::new(config),
            sessions,
        }
    }
}

/// Routes without middleware.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api", get(api_root))
        .route("/api/sessions/{session_id}", get(session_status))
        .route("/api/players/{player_id}/sessions", get(player_sessions))
        .fallback(not_found)
}

/// The full application: routes, panic-to-500, permissive CORS, and
/// request tracing.
pub fn app(state: AppState) -> Router {
    with_middleware(router(), state)
}

fn with_middleware(routes: Router<AppState>, state: AppState) -> Router {
    // Mirrors the request origin so credentialed requests work from any
    // client origin.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);
    let panics = CatchPanicLayer::custom(PanicResponse {
        config: Arc::clone(&state.config),
    });

    routes
        .layer(panics)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Turns a panicking handler into a JSON 500.
#[derive(Clone)]
struct PanicResponse {
    config: Arc<ServerConfig>,
}

impl ResponseForPanic for PanicResponse {
    type ResponseBody = axum::body::Body;

    fn response_for_panic(&mut self, err: Box<dyn Any + Send + 'static>) -> Response {
        let detail = if let Some(message) = err.downcast_ref::<String>() {
            message.as_str()
        } else if let Some(message) = err.downcast_ref::<&str>() {
            message
        } else {
            "handler panicked"
        };
        ApiError::internal(&self.config, detail).into_response()
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "service": "sboboz-backend",
        "env": state.config.env,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

async fn api_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Sboboz 104 API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Public view of a session. Never includes the reconnect token.
#[derive(Debug, Serialize)]
struct SessionStatus {
    session_id: String,
    player_id: String,
    state: &'static str,
    lobby_id: Option<String>,
    /// Time since the session was created, across reconnects.
    age_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    grace_remaining_ms: Option<u64>,
}

impl SessionStatus {
    fn of(session: Session, now: Instant) -> Self {
        let grace_remaining_ms = session
            .state
            .deadline()
            .map(|deadline| deadline.saturating_duration_since(now).as_millis() as u64);

        Self {
            session_id: session.session_id.as_str().to_string(),
            player_id: session.identity.as_str().to_string(),
            state: session.state.name(),
            lobby_id: session.lobby.map(|l| l.0),
            age_ms: now.saturating_duration_since(session.created_at).as_millis() as u64,
            grace_remaining_ms,
        }
    }
}

#[derive(Debug, Serialize)]
struct PlayerSessions {
    player_id: String,
    sessions: Vec<SessionStatus>,
}

async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    if session_id.len() != 32 || !session_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ApiError::validation("session id must be 32 hex characters"));
    }

    let session = state
        .sessions
        .get(&SessionId::new(session_id))
        .ok_or_else(|| ApiError::not_found("Session not found").with_code("SESSION_NOT_FOUND"))?;

    Ok(Json(SessionStatus::of(session, Instant::now())))
}

/// Every live session of one player; empty when there are none.
async fn player_sessions(
    State(state): State<AppState>,
    Path(player_id): Path<String>,
) -> Result<Json<PlayerSessions>, ApiError> {
    let player_id = player_id.trim();
    if player_id.is_empty() || player_id.len() > 128 {
        return Err(ApiError::validation("player id must be 1 to 128 characters"));
    }

    let now = Instant::now();
    let sessions = state
        .sessions
        .sessions_of(&PlayerId::new(player_id))
        .iter()
        .filter_map(|id| state.sessions.get(id))
        .map(|session| SessionStatus::of(session, now))
        .collect();

    Ok(Json(PlayerSessions {
        player_id: player_id.to_string(),
        sessions,
    }))
}

async fn not_found() -> ApiError {
    ApiError::not_found("Not found")
}

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

/// Client-facing API error, rendered as `{ "error": ..., "code": ... }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: Option<String>,
    pub message: String,
}

impl ApiError {
    /// A 400 with no code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: None,
            message: message.into(),
        }
    }

    /// Invalid input: 422 with code `VALIDATION_ERROR`.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(message)
            .with_status(StatusCode::UNPROCESSABLE_ENTITY)
            .with_code("VALIDATION_ERROR")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(message).with_status(StatusCode::NOT_FOUND)
    }

    /// A 500. The detail reaches the client only in development.
    pub fn internal(config: &ServerConfig, err: impl fmt::Display) -> Self {
        tracing::error!(error = %err, "internal error");
        let message = if config.is_dev() {
            err.to_string()
        } else {
            "Internal server error".to_string()
        };
        Self::new(message).with_status(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_api_error_default_is_400_without_code() {
        let resp = ApiError::new("bad move").into_response();

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await, serde_json::json!({ "error": "bad move" }));
    }

    #[tokio::test]
    async fn test_api_error_validation_is_422_with_code() {
        let resp = ApiError::validation("name required").into_response();

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({ "error": "name required", "code": "VALIDATION_ERROR" })
        );
    }

    #[tokio::test]
    async fn test_api_error_internal_shows_detail_in_development() {
        let config = ServerConfig::default();

        let resp = ApiError::internal(&config, "db on fire").into_response();

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["error"], "db on fire");
    }

    #[tokio::test]
    async fn test_api_error_internal_hides_detail_in_production() {
        let config = ServerConfig {
            env: "production".into(),
            ..ServerConfig::default()
        };

        let resp = ApiError::internal(&config, "db on fire").into_response();

        assert_eq!(
            body_json(resp).await,
            serde_json::json!({ "error": "Internal server error" })
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_json_500() {
        use tower::ServiceExt;

        async fn explode() -> &'static str {
            panic!("lobby table corrupted")
        }

        let store = Arc::new(SessionStore::new(Default::default()));
        let dev = with_middleware(
            Router::new().route("/explode", get(explode)),
            AppState::new(ServerConfig::default(), Arc::clone(&store)),
        );
        let prod = with_middleware(
            Router::new().route("/explode", get(explode)),
            AppState::new(
                ServerConfig {
                    env: "production".into(),
                    ..ServerConfig::default()
                },
                store,
            ),
        );
        let request = || {
            axum::http::Request::builder()
                .uri("/explode")
                .body(axum::body::Body::empty())
                .unwrap()
        };

        let resp = dev.oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["error"], "lobby table corrupted");

        let resp = prod.oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({ "error": "Internal server error" })
        );
    }

    #[test]
    fn test_api_error_custom_code_and_status() {
        let err = ApiError::new("lobby is full")
            .with_code("LOBBY_FULL")
            .with_status(StatusCode::CONFLICT);

        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code.as_deref(), Some("LOBBY_FULL"));
        assert_eq!(err.to_string(), "409 lobby is full");
    }
}
