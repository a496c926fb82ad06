use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::lease::TerminationReason;
use crate::validate::{self, ValidationError};

/// What the daemon pushes to the watchdog every heartbeat interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub instance_id: String,
    /// Producer clock. Informational only.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub uptime_minutes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_loaded: Option<String>,
    /// Health of monitored sub-services, keyed by service name.
    #[serde(default)]
    pub services: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
}

impl HeartbeatPayload {
    /// Validate an untrusted JSON body field by field.
    ///
    /// Besides the `services` map, top-level `*_healthy` booleans are folded
    /// into `services` so older emitters keep working.
    pub fn from_json(value: &Value) -> Result<Self, ValidationError> {
        let obj = validate::as_object(value)?;

        let instance_id = validate::required_str(obj, "instance_id")?;
        validate::validate_instance_id(instance_id)?;
        let timestamp = validate::required_timestamp(obj, "timestamp")?;
        let uptime_minutes = validate::optional_u64(obj, "uptime_minutes")?;
        let model_loaded = validate::optional_str(obj, "model_loaded")?.map(str::to_string);

        let mut services = BTreeMap::new();
        match obj.get("services") {
            None | Some(Value::Null) => {}
            Some(Value::Object(map)) => {
                for (name, healthy) in map {
                    let healthy = healthy.as_bool().ok_or_else(|| {
                        ValidationError::invalid("services", format!("entry '{name}' must be a boolean"))
                    })?;
                    services.insert(name.clone(), healthy);
                }
            }
            Some(_) => return Err(ValidationError::invalid("services", "must be an object")),
        }
        for (key, v) in obj {
            if let Some(name) = key.strip_suffix("_healthy") {
                let healthy = v
                    .as_bool()
                    .ok_or_else(|| ValidationError::invalid("services", format!("'{key}' must be a boolean")))?;
                services.insert(name.to_string(), healthy);
            }
        }

        let termination_reason = match validate::optional_str(obj, "termination_reason")? {
            None => None,
            Some(raw) => Some(TerminationReason::parse(raw).ok_or_else(|| {
                ValidationError::invalid("termination_reason", format!("unknown reason '{raw}'"))
            })?),
        };

        Ok(Self {
            instance_id: instance_id.to_string(),
            timestamp,
            uptime_minutes,
            model_loaded,
            services,
            termination_reason,
        })
    }

    /// Stamp the payload with the receiver's clock.
    pub fn into_record(self, received_at: DateTime<Utc>) -> HeartbeatRecord {
        HeartbeatRecord {
            instance_id: self.instance_id,
            sent_at: self.timestamp,
            received_at,
            uptime_minutes: self.uptime_minutes,
            model_loaded: self.model_loaded,
            services: self.services,
            termination_reason: self.termination_reason,
        }
    }
}

/// The watchdog's last-write-wins view of an instance's most recent heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub instance_id: String,
    pub sent_at: DateTime<Utc>,
    /// Watchdog clock at ingestion. All staleness math uses this field.
    pub received_at: DateTime<Utc>,
    pub uptime_minutes: u64,
    #[serde(default)]
    pub model_loaded: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<String, bool>,
    #[serde(default)]
    pub termination_reason: Option<TerminationReason>,
}

impl HeartbeatRecord {
    pub fn staleness(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.received_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_minimal_payload() {
        let hb = HeartbeatPayload::from_json(&json!({
            "instance_id": "i-1",
            "timestamp": "2026-03-01T12:00:00Z",
        }))
        .unwrap();
        assert_eq!(hb.instance_id, "i-1");
        assert_eq!(hb.uptime_minutes, 0);
        assert!(hb.services.is_empty());
    }

    #[test]
    fn folds_legacy_health_flags() {
        let hb = HeartbeatPayload::from_json(&json!({
            "instance_id": "i-1",
            "timestamp": "2026-03-01T12:00:00Z",
            "uptime_minutes": 42,
            "model_loaded": "llama",
            "sglang_healthy": true,
            "n8n_healthy": false,
            "services": {"probe": true},
        }))
        .unwrap();
        assert_eq!(hb.services.get("sglang"), Some(&true));
        assert_eq!(hb.services.get("n8n"), Some(&false));
        assert_eq!(hb.services.get("probe"), Some(&true));
        assert_eq!(hb.model_loaded.as_deref(), Some("llama"));
    }

    #[test]
    fn rejects_malformed_payloads() {
        let cases = [
            json!({"timestamp": "2026-03-01T12:00:00Z"}),
            json!({"instance_id": "i-1"}),
            json!({"instance_id": "i-1", "timestamp": "yesterday"}),
            json!({"instance_id": 7, "timestamp": "2026-03-01T12:00:00Z"}),
            json!({"instance_id": "i-1", "timestamp": "2026-03-01T12:00:00Z", "uptime_minutes": -4}),
            json!({"instance_id": "i-1", "timestamp": "2026-03-01T12:00:00Z", "services": {"a": "yes"}}),
            json!({"instance_id": "i-1", "timestamp": "2026-03-01T12:00:00Z", "termination_reason": "boredom"}),
            json!("not an object"),
        ];
        for case in cases {
            assert!(HeartbeatPayload::from_json(&case).is_err(), "accepted {case}");
        }
    }

    #[test]
    fn record_uses_receiver_clock() {
        let sent: DateTime<Utc> = "2030-01-01T00:00:00Z".parse().unwrap();
        let received: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().unwrap();
        let hb = HeartbeatPayload {
            instance_id: "i-1".into(),
            timestamp: sent,
            uptime_minutes: 1,
            model_loaded: None,
            services: BTreeMap::new(),
            termination_reason: None,
        };
        let record = hb.into_record(received);
        assert_eq!(record.received_at, received);
        assert_eq!(record.sent_at, sent);
        assert_eq!(
            record.staleness(received + chrono::Duration::seconds(30)),
            chrono::Duration::seconds(30)
        );
    }
}
