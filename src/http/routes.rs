//! HTTP route definitions

use axum::{
    extract::{Extension, Path, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{snapshot, GameError, MatchSnapshot};
use crate::http::middleware::{require_auth, AuthenticatedPlayer};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/matches/:id", get(snapshot_handler))
        .route("/matches/:id/join", post(join_handler))
        .route("/matches/:id/start", post(start_handler))
        .route("/matches/:id/vote", post(vote_handler))
        .route("/matches/:id/night-action", post(night_action_handler))
        .route("/matches/:id/leave", post(leave_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_matches: usize,
    active_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_matches: state.registry.active_matches(),
        active_players: state.registry.total_players(),
    })
}

// ============================================================================
// Match command endpoints
// ============================================================================

async fn join_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedPlayer>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<MatchSnapshot>, AppError> {
    let handle = state.registry.get_or_create(match_id).await?;
    let snapshot = handle
        .join(auth.player_id, auth.claims.display_name())
        .await?;
    Ok(Json(snapshot))
}

async fn start_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedPlayer>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<MatchSnapshot>, AppError> {
    let handle = state.registry.get_or_create(match_id).await?;
    Ok(Json(handle.start(auth.player_id).await?))
}

#[derive(Deserialize)]
struct VoteRequest {
    target_id: Uuid,
    round: u32,
}

async fn vote_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedPlayer>,
    Path(match_id): Path<Uuid>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<MatchSnapshot>, AppError> {
    let handle = state.registry.get_or_create(match_id).await?;
    Ok(Json(
        handle
            .cast_vote(auth.player_id, req.target_id, req.round)
            .await?,
    ))
}

#[derive(Deserialize)]
struct NightActionRequest {
    target_id: Uuid,
}

async fn night_action_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedPlayer>,
    Path(match_id): Path<Uuid>,
    Json(req): Json<NightActionRequest>,
) -> Result<Json<MatchSnapshot>, AppError> {
    let handle = state.registry.get_or_create(match_id).await?;
    Ok(Json(
        handle.night_action(auth.player_id, req.target_id).await?,
    ))
}

async fn leave_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedPlayer>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<MatchSnapshot>, AppError> {
    let handle = state.registry.get_or_create(match_id).await?;
    Ok(Json(handle.leave(auth.player_id).await?))
}

/// Viewer-scoped snapshot read. Retired matches are served from the
/// registry archive without waking an engine; unknown matches are 404,
/// not implicitly created.
async fn snapshot_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedPlayer>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<MatchSnapshot>, AppError> {
    if let Some(terminal) = state.registry.archived(&match_id) {
        return Ok(Json(snapshot::project(&terminal, Some(auth.player_id))));
    }

    match state.registry.resolve_existing(match_id).await? {
        Some(handle) => Ok(Json(handle.snapshot(Some(auth.player_id)).await?)),
        None => Err(AppError::NotFound(format!("no match {}", match_id))),
    }
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Game(#[from] GameError),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, kind, message) = match &self {
            AppError::Game(err) => (game_status(err), err.kind(), err.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
        };

        let body = json!({
            "error": {
                "kind": kind,
                "message": message,
            }
        });

        (status, Json(body)).into_response()
    }
}

/// Map engine rejections onto HTTP statuses: guard violations are
/// conflicts with the current match state, membership failures are
/// forbidden, corruption and transport troubles are server-side.
fn game_status(err: &GameError) -> StatusCode {
    match err {
        GameError::AlreadyStarted
        | GameError::MatchFull
        | GameError::AlreadyJoined
        | GameError::NotEnoughPlayers
        | GameError::InvalidTransition(_)
        | GameError::NotAlive
        | GameError::TargetNotAlive
        | GameError::SelfTarget
        | GameError::WrongRound
        | GameError::WrongPhase => StatusCode::CONFLICT,
        GameError::NotAMember | GameError::NotAWolf => StatusCode::FORBIDDEN,
        GameError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        GameError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
