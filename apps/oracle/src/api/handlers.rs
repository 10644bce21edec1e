//! # API Endpoint Handlers
//!
//! This module implements the actual HTTP endpoint handlers.
//!
//! Turns and session creation take the write lock; the engine serializes
//! every change to a session behind it.

use super::{
    AppState,
    types::{
        ApiError, CreateSessionRequest, HealthResponse, HistoryResponse, SafetyAlertRequest,
        SafetyAlertResponse, SessionResponse, SignalsQuery, SignalsResponse, TurnRequest,
        TurnResponse, UserStageResponse, validate_id,
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use oracle_core::{SessionId, StageProgress, StageTable, UserId};

// =============================================================================
// HEALTH HANDLER
// =============================================================================

/// Health check endpoint.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse::default())
}

// =============================================================================
// STAGE TABLE HANDLER
// =============================================================================

/// The stage table the engine runs with.
pub async fn stages_handler(State(state): State<AppState>) -> Json<StageTable> {
    let oracle = state.oracle.read().await;
    Json(oracle.table().clone())
}

// =============================================================================
// SESSION HANDLERS
// =============================================================================

/// Start (or replace) a session.
pub async fn create_session_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    request.validate()?;
    let ctx = request.to_context();

    let mut oracle = state.oracle.write().await;
    let session = oracle.initialize_session(
        UserId::new(&request.user_id),
        SessionId::new(&request.session_id),
        &ctx,
    );
    Ok((StatusCode::CREATED, Json(SessionResponse::from(&session))))
}

/// Read a live session.
pub async fn get_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    validate_id("session_id", &id)?;
    let oracle = state.oracle.read().await;
    match oracle.active_session(&SessionId::new(&id))? {
        Some(session) => Ok(Json(SessionResponse::from(&session))),
        None => Err(ApiError::not_found(format!("Session not found: {}", id))),
    }
}

/// End a session. Its transitions stay in the user's history.
pub async fn end_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    validate_id("session_id", &id)?;
    let mut oracle = state.oracle.write().await;
    let session = oracle.end_session(&SessionId::new(&id))?;
    Ok(Json(SessionResponse::from(&session)))
}

/// Process one turn.
///
/// Unknown sessions are a 404 here; past that point the engine never fails
/// and a broken turn comes back as the fallback reply.
pub async fn turn_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    validate_id("session_id", &id)?;
    request.validate()?;
    let session_id = SessionId::new(&id);

    let mut oracle = state.oracle.write().await;
    if oracle.active_session(&session_id)?.is_none() {
        return Err(ApiError::not_found(format!("Session not found: {}", id)));
    }
    let outcome = oracle.generate_response(&session_id, &request.input, &request.to_context());
    Ok(Json(TurnResponse::from(outcome)))
}

/// Progress of a session toward its next stage.
pub async fn progress_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StageProgress>, ApiError> {
    validate_id("session_id", &id)?;
    let oracle = state.oracle.read().await;
    Ok(Json(oracle.stage_progress(&SessionId::new(&id))?))
}

// =============================================================================
// USER HANDLERS
// =============================================================================

/// The stage a user is currently served at.
pub async fn user_stage_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UserStageResponse>, ApiError> {
    validate_id("user_id", &id)?;
    let user_id = UserId::new(&id);
    let oracle = state.oracle.read().await;
    let stage = oracle.current_stage(&user_id)?;
    Ok(Json(UserStageResponse {
        user_id,
        stage,
        name: stage.name().to_string(),
    }))
}

/// All stage transitions recorded for a user.
pub async fn user_history_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    validate_id("user_id", &id)?;
    let user_id = UserId::new(&id);
    let oracle = state.oracle.read().await;
    let transitions = oracle.session_history(&user_id)?;
    Ok(Json(HistoryResponse {
        user_id,
        transitions,
    }))
}

/// Current signal reading plus recent snapshots.
pub async fn user_signals_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SignalsQuery>,
) -> Result<Json<SignalsResponse>, ApiError> {
    validate_id("user_id", &id)?;
    let user_id = UserId::new(&id);
    let oracle = state.oracle.read().await;
    let explanation = oracle.explain_signals(&user_id)?;
    let history = oracle.signal_history(&user_id, query.days)?;
    Ok(Json(SignalsResponse {
        user_id,
        explanation,
        history,
    }))
}

// =============================================================================
// SAFETY ALERT HANDLER
// =============================================================================

/// Flag a user's next turn for a safety collapse.
pub async fn safety_alert_handler(
    State(state): State<AppState>,
    Json(request): Json<SafetyAlertRequest>,
) -> Result<(StatusCode, Json<SafetyAlertResponse>), ApiError> {
    request.validate()?;
    let user_id = UserId::new(&request.user_id);
    let oracle = state.oracle.read().await;
    oracle.raise_safety_alert(&user_id, &request.reason);
    Ok((
        StatusCode::ACCEPTED,
        Json(SafetyAlertResponse {
            accepted: true,
            user_id,
        }),
    ))
}
