use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod auth;
pub mod clock;
pub mod defaults;
pub mod event;
pub mod heartbeat;
pub mod lease;
pub mod retry;
pub mod validate;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use event::TerminationEvent;
pub use heartbeat::{HeartbeatPayload, HeartbeatRecord};
pub use lease::{LeaseConfig, LeaseError, LeasePhase, LeaseSnapshot, LeaseState, TerminationReason};
pub use retry::RetryPolicy;
pub use validate::ValidationError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendRequest {
    pub hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendResponse {
    pub new_deadline: DateTime<Utc>,
    pub total_hours: f64,
    pub extended_by_hours: i64,
    pub available_extension_hours: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityResponse {
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub status: String,
}

/// Error body shared by the daemon and the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreAck {
    pub success: bool,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogStatus {
    pub service: String,
    pub version: String,
    pub tracked_instances: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsQuery {
    pub hours: Option<i64>,
    pub instance_id: Option<String>,
    pub event_type: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTotals {
    pub events: usize,
    pub by_reason: BTreeMap<String, usize>,
    pub uptime_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsResponse {
    pub events: Vec<TerminationEvent>,
    pub count: usize,
    pub totals: EventTotals,
}
