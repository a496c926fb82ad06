use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    ActivityResponse, Clock, ErrorResponse, ExtendRequest, ExtendResponse, HealthResponse,
    LeaseError, LeaseSnapshot, SharedClock, ShutdownResponse, TerminationReason,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::keeper::{KeeperError, LeaseKeeper};
use crate::terminate::Terminator;

#[derive(Clone)]
pub struct AppState {
    pub keeper: Arc<LeaseKeeper>,
    pub terminator: Arc<Terminator>,
    pub clock: SharedClock,
    pub token: Arc<str>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    ExceedsMaximum { message: String, available_hours: f64 },
    ShuttingDown,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, available_hours) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string(), None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::ExceedsMaximum {
                message,
                available_hours,
            } => (StatusCode::CONFLICT, message, Some(available_hours)),
            ApiError::ShuttingDown => (
                StatusCode::SERVICE_UNAVAILABLE,
                "shutting down".to_string(),
                None,
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };
        (
            status,
            Json(ErrorResponse {
                error,
                available_hours,
            }),
        )
            .into_response()
    }
}

impl From<LeaseError> for ApiError {
    fn from(e: LeaseError) -> Self {
        match e {
            LeaseError::InvalidHours(_) => ApiError::BadRequest(e.to_string()),
            LeaseError::ExceedsMaximum {
                available_hours, ..
            } => ApiError::ExceedsMaximum {
                message: e.to_string(),
                available_hours,
            },
            LeaseError::ShuttingDown => ApiError::ShuttingDown,
        }
    }
}

impl From<KeeperError> for ApiError {
    fn from(e: KeeperError) -> Self {
        match e {
            KeeperError::Lease(e) => e.into(),
            KeeperError::Persist(e) => {
                error!("Lease persistence failed: {}", e);
                ApiError::Internal("failed to persist lease".to_string())
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/status", get(status))
        .route("/activity", post(activity))
        .route("/extend", post(extend))
        .route("/shutdown", post(shutdown))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Middleware: rejects anything without the shared bearer token.
async fn auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if common::auth::bearer_matches(header, &state.token) {
        Ok(next.run(req).await)
    } else {
        warn!("Rejected {} {}: bad or missing token", req.method(), req.uri().path());
        Err(ApiError::Unauthorized)
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn status(State(state): State<AppState>) -> Json<LeaseSnapshot> {
    Json(state.keeper.snapshot(state.clock.now()))
}

async fn activity(State(state): State<AppState>) -> Result<Json<ActivityResponse>, ApiError> {
    let last_activity_at = state.keeper.record_activity(state.clock.now())?;
    Ok(Json(ActivityResponse { last_activity_at }))
}

async fn extend(
    State(state): State<AppState>,
    payload: Result<Json<ExtendRequest>, JsonRejection>,
) -> Result<Json<ExtendResponse>, ApiError> {
    let Json(req) = payload.map_err(|e| {
        ApiError::BadRequest(format!("hours must be a positive integer: {}", e.body_text()))
    })?;
    let lease = state.keeper.extend(req.hours)?;
    info!(
        "Lease extended by {}h; new deadline {}",
        req.hours, lease.lease_deadline
    );
    Ok(Json(ExtendResponse {
        new_deadline: lease.lease_deadline,
        total_hours: lease.total_hours(),
        extended_by_hours: req.hours,
        available_extension_hours: lease.available_extension_hours(),
    }))
}

async fn shutdown(State(state): State<AppState>) -> Json<ShutdownResponse> {
    let reason = state.terminator.request(TerminationReason::Manual);
    info!("Shutdown requested by operator (committed reason: {})", reason);
    Json(ShutdownResponse {
        status: "shutting_down".to_string(),
    })
}
