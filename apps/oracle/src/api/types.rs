//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use oracle_core::{
    AgentId, AgentResponse, CapacitySignals, ObservedLevels, OracleError, PersonalOracleSession,
    SessionContext, SessionId, SignalExplanation, Stage, StageTransition, TurnContext,
    TurnOutcome, UserId,
    primitives::{MAX_ID_LENGTH, MAX_INPUT_LENGTH},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// HEALTH RESPONSE
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Body of every non-2xx JSON response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error carrying its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<OracleError> for ApiError {
    fn from(e: OracleError) -> Self {
        let status = match &e {
            OracleError::SessionNotFound(_) | OracleError::AgentNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            OracleError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => {
                tracing::error!(event = "api_error", error = %e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Reject empty or oversized identifiers before they reach the engine.
pub fn validate_id(kind: &str, id: &str) -> Result<(), ApiError> {
    if id.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{} must not be empty", kind)));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(ApiError::bad_request(format!(
            "{} length {} exceeds maximum {} bytes",
            kind,
            id.len(),
            MAX_ID_LENGTH
        )));
    }
    Ok(())
}

fn validate_text(kind: &str, text: &str) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{} must not be empty", kind)));
    }
    if text.len() > MAX_INPUT_LENGTH {
        return Err(ApiError::bad_request(format!(
            "{} length {} exceeds maximum {} bytes",
            kind,
            text.len(),
            MAX_INPUT_LENGTH
        )));
    }
    Ok(())
}

// =============================================================================
// SESSIONS
// =============================================================================

/// Session creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    pub session_id: String,
    /// Agents the client would like, most preferred first.
    #[serde(default)]
    pub preferred_agents: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CreateSessionRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        validate_id("user_id", &self.user_id)?;
        validate_id("session_id", &self.session_id)?;
        for agent in &self.preferred_agents {
            validate_id("preferred agent", agent)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn to_context(&self) -> SessionContext {
        SessionContext {
            preferred_agents: self.preferred_agents.iter().map(AgentId::new).collect(),
            metadata: self.metadata.clone(),
        }
    }
}

/// A session as seen by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub stage: Stage,
    pub stage_name: String,
    pub agent_id: AgentId,
    pub turn_count: u32,
    pub turns_in_stage: u32,
    pub transitions: usize,
    pub signals: CapacitySignals,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl From<&PersonalOracleSession> for SessionResponse {
    fn from(s: &PersonalOracleSession) -> Self {
        let stage = s.current_stage();
        Self {
            user_id: s.user_id.clone(),
            session_id: s.session_id.clone(),
            stage,
            stage_name: stage.name().to_string(),
            agent_id: s.agent_id.clone(),
            turn_count: s.turn_count,
            turns_in_stage: s.turns_in_stage,
            transitions: s.stage_history().len(),
            signals: s.signals.clone(),
            started_at: s.started_at,
            last_activity: s.last_activity,
        }
    }
}

// =============================================================================
// TURNS
// =============================================================================

/// One user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub input: String,
    /// Host-observed levels that override the ones derived from `input`.
    #[serde(default)]
    pub observed: ObservedLevels,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TurnRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        validate_text("input", &self.input)
    }

    #[must_use]
    pub fn to_context(&self) -> TurnContext {
        TurnContext {
            observed: self.observed.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Reply to one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub response: AgentResponse,
    pub session: Option<SessionResponse>,
    pub stage_changed: bool,
    pub transition: Option<StageTransition>,
}

impl From<TurnOutcome> for TurnResponse {
    fn from(outcome: TurnOutcome) -> Self {
        Self {
            response: outcome.response,
            session: outcome.session.as_ref().map(SessionResponse::from),
            stage_changed: outcome.stage_changed,
            transition: outcome.transition,
        }
    }
}

// =============================================================================
// USERS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStageResponse {
    pub user_id: UserId,
    pub stage: Stage,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub user_id: UserId,
    pub transitions: Vec<StageTransition>,
}

fn default_days() -> u32 {
    30
}

/// Query string of `GET /users/{id}/signals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsQuery {
    #[serde(default = "default_days")]
    pub days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsResponse {
    pub user_id: UserId,
    pub explanation: SignalExplanation,
    pub history: Vec<CapacitySignals>,
}

// =============================================================================
// SAFETY ALERTS
// =============================================================================

/// External safety concern about a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyAlertRequest {
    pub user_id: String,
    pub reason: String,
}

impl SafetyAlertRequest {
    pub fn validate(&self) -> Result<(), ApiError> {
        validate_id("user_id", &self.user_id)?;
        validate_text("reason", &self.reason)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyAlertResponse {
    pub accepted: bool,
    pub user_id: UserId,
}
