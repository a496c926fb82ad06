use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, Request, State,
    },
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    ErrorResponse, EventsQuery, EventsResponse, HealthResponse, HeartbeatPayload, HeartbeatRecord,
    StoreAck, TerminationEvent, ValidationError, WatchdogStatus,
};
use serde_json::Value;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, warn};

use crate::events::EventLog;
use crate::heartbeats::HeartbeatRegistry;
use crate::store::StoreError;

pub const SERVICE_NAME: &str = "gpulease-watchdog";

#[derive(Clone)]
pub struct AppState {
    pub heartbeats: HeartbeatRegistry,
    pub events: EventLog,
    pub token: Arc<str>,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };
        (
            status,
            Json(ErrorResponse {
                error,
                available_hours: None,
            }),
        )
            .into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!("Store operation failed: {}", e);
        ApiError::Unavailable("storage unavailable".to_string())
    }
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/heartbeat", post(ingest_heartbeat))
        .route("/heartbeats", get(list_heartbeats))
        .route("/events", post(record_event))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/events", get(query_events))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

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

fn json_body(payload: Result<Json<Value>, JsonRejection>) -> Result<Value, ApiError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e.body_text())))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

async fn status(State(state): State<AppState>) -> Result<Json<WatchdogStatus>, ApiError> {
    let tracked = state.heartbeats.all().await?.len();
    Ok(Json(WatchdogStatus {
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tracked_instances: tracked,
    }))
}

async fn ingest_heartbeat(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<StoreAck>, ApiError> {
    let heartbeat = HeartbeatPayload::from_json(&json_body(payload)?)?;
    let (key, _) = state.heartbeats.ingest(heartbeat).await?;
    Ok(Json(StoreAck { success: true, key }))
}

async fn list_heartbeats(State(state): State<AppState>) -> Result<Json<Vec<HeartbeatRecord>>, ApiError> {
    Ok(Json(state.heartbeats.all().await?.into_values().collect()))
}

async fn record_event(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<StoreAck>, ApiError> {
    let event = TerminationEvent::from_json(&json_body(payload)?)?;
    let key = state.events.append(&event).await?;
    Ok(Json(StoreAck { success: true, key }))
}

async fn query_events(
    State(state): State<AppState>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Json<EventsResponse>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if query.hours.is_some_and(|h| h <= 0) {
        return Err(ApiError::BadRequest("hours must be a positive integer".to_string()));
    }
    if query.limit == Some(0) {
        return Err(ApiError::BadRequest("limit must be a positive integer".to_string()));
    }
    Ok(Json(state.events.query(&query).await?))
}
