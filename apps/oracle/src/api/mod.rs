//! # Oracle HTTP API Module
//!
//! This module implements the HTTP REST API server using axum.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /stages` - The stage table
//! - `POST /sessions` - Start or replace a session
//! - `GET /sessions/{id}` - Read a live session
//! - `DELETE /sessions/{id}` - End a session
//! - `POST /sessions/{id}/turns` - Send one user turn
//! - `GET /sessions/{id}/progress` - Progress toward the next stage
//! - `GET /users/{id}/stage` - Stage a user is currently served at
//! - `GET /users/{id}/history` - Stage transitions of a user
//! - `GET /users/{id}/signals?days=N` - Capacity signals of a user
//! - `POST /safety-alerts` - Report an external safety concern
//!
//! ## Security Configuration (Environment Variables)
//!
//! - `ORACLE_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all (default: localhost only)
//! - `ORACLE_RATE_LIMIT`: Requests per second (default: 100, 0 to disable)
//! - `ORACLE_API_KEY`: If set, requires Bearer token authentication

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::{API_KEY_ENV, get_api_key_from_env};
pub use middleware::{RATE_LIMIT_ENV, create_rate_limiter, get_rate_limit_from_env};
pub use types::{
    ApiError, CreateSessionRequest, ErrorResponse, HealthResponse, HistoryResponse,
    SafetyAlertRequest, SafetyAlertResponse, SessionResponse, SignalsQuery, SignalsResponse,
    TurnRequest, TurnResponse, UserStageResponse, validate_id,
};

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use oracle_core::{Oracle, OracleError};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Environment variable holding the allowed CORS origins.
pub const CORS_ORIGINS_ENV: &str = "ORACLE_CORS_ORIGINS";

/// Request bodies above this size are rejected with 413.
const MAX_BODY_BYTES: usize = 64 * 1024;

const CORS_METHODS: [Method; 4] = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state: one engine per process.
#[derive(Clone)]
pub struct AppState {
    pub oracle: Arc<RwLock<Oracle>>,
}

impl AppState {
    #[must_use]
    pub fn new(oracle: Oracle) -> Self {
        Self {
            oracle: Arc::new(RwLock::new(oracle)),
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build the CORS layer from `ORACLE_CORS_ORIGINS`.
///
/// - `*` allows every origin
/// - unset or without a valid entry: localhost only
/// - otherwise a comma-separated allow list
fn build_cors_layer() -> CorsLayer {
    match std::env::var(CORS_ORIGINS_ENV).ok().as_deref() {
        Some("*") => {
            tracing::warn!("CORS: allowing ALL origins ({}=*)", CORS_ORIGINS_ENV);
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => {
                            tracing::info!("CORS: allowing origin: {}", trimmed);
                            Some(hv)
                        }
                        Err(e) => {
                            tracing::warn!("CORS: invalid origin '{}': {}", trimmed, e);
                            None
                        }
                    }
                })
                .collect();

            if allowed.is_empty() {
                tracing::warn!(
                    "CORS: no valid origins in {}, defaulting to localhost only",
                    CORS_ORIGINS_ENV
                );
                build_localhost_cors()
            } else {
                CorsLayer::new()
                    .allow_origin(allowed)
                    .allow_methods(CORS_METHODS)
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            }
        }
        None => build_localhost_cors(),
    }
}

fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .into_iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(CORS_METHODS)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner):
/// 1. Tracing
/// 2. CORS
/// 3. Body limit
/// 4. Rate limiting (if enabled)
/// 5. Authentication (if configured)
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer();

    let rate_limit = get_rate_limit_from_env();
    let rate_limiter = if rate_limit > 0 {
        tracing::info!("Rate limiting enabled: {} requests/second", rate_limit);
        Some(create_rate_limiter(rate_limit))
    } else {
        tracing::info!("Rate limiting disabled");
        None
    };

    let has_auth = get_api_key_from_env().is_some();
    if has_auth {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED - all endpoints are publicly accessible. \
             Set {} to enable authentication.",
            API_KEY_ENV
        );
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/stages", get(handlers::stages_handler))
        .route("/sessions", post(handlers::create_session_handler))
        .route(
            "/sessions/{id}",
            get(handlers::get_session_handler).delete(handlers::end_session_handler),
        )
        .route("/sessions/{id}/turns", post(handlers::turn_handler))
        .route("/sessions/{id}/progress", get(handlers::progress_handler))
        .route("/users/{id}/stage", get(handlers::user_stage_handler))
        .route("/users/{id}/history", get(handlers::user_history_handler))
        .route("/users/{id}/signals", get(handlers::user_signals_handler))
        .route("/safety-alerts", post(handlers::safety_alert_handler));

    if has_auth {
        router = router.layer(axum_middleware::from_fn(auth::api_key_auth_middleware));
    }

    if let Some(limiter) = rate_limiter {
        router = router.layer(axum_middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve `oracle` on `addr` until the process is stopped.
pub async fn run_server(addr: &str, oracle: Oracle) -> Result<(), OracleError> {
    let router = create_router(AppState::new(oracle));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| OracleError::Io(format!("Bind failed: {}", e)))?;

    tracing::info!("Oracle HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .await
        .map_err(|e| OracleError::Io(format!("Server error: {}", e)))
}
