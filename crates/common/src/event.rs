use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lease::TerminationReason;
use crate::validate::{self, ValidationError};

pub const EVENT_KEY_PREFIX: &str = "event:";

/// Audit record of one termination decision. Written once, never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationEvent {
    pub timestamp: DateTime<Utc>,
    pub instance_id: String,
    pub reason: TerminationReason,
    pub uptime_minutes: u64,
    #[serde(default)]
    pub gpu_type: String,
    #[serde(default)]
    pub region: String,
}

impl TerminationEvent {
    /// `event:{timestamp}_{instance_id}_{reason}`. Timestamps are fixed-width
    /// so keys sort chronologically.
    pub fn key(&self) -> String {
        format!(
            "{}{}_{}_{}",
            EVENT_KEY_PREFIX,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.instance_id,
            self.reason
        )
    }

    pub fn from_json(value: &Value) -> Result<Self, ValidationError> {
        let obj = validate::as_object(value)?;
        let instance_id = validate::required_str(obj, "instance_id")?;
        validate::validate_instance_id(instance_id)?;
        let timestamp = validate::required_timestamp(obj, "timestamp")?;
        let raw_reason = match validate::optional_str(obj, "reason")? {
            Some(r) => r,
            None => validate::optional_str(obj, "event_type")?
                .ok_or(ValidationError::MissingField("reason"))?,
        };
        let reason = TerminationReason::parse(raw_reason)
            .ok_or_else(|| ValidationError::invalid("reason", format!("unknown reason '{raw_reason}'")))?;
        Ok(Self {
            timestamp,
            instance_id: instance_id.to_string(),
            reason,
            uptime_minutes: validate::optional_u64(obj, "uptime_minutes")?,
            gpu_type: validate::optional_str(obj, "gpu_type")?.unwrap_or_default().to_string(),
            region: validate::optional_str(obj, "region")?.unwrap_or_default().to_string(),
        })
    }
}
