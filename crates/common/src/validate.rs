use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub const MAX_INSTANCE_ID_LEN: usize = 128;

/// Rejection of a payload at an API boundary. Carries the offending field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ValidationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Instance ids are opaque, but they end up in store keys, so keep them printable.
pub fn validate_instance_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::invalid("instance_id", "must not be empty"));
    }
    if id.len() > MAX_INSTANCE_ID_LEN {
        return Err(ValidationError::invalid(
            "instance_id",
            format!("exceeds {} characters (got {})", MAX_INSTANCE_ID_LEN, id.len()),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ValidationError::invalid(
            "instance_id",
            "must contain only letters, digits, '-', '_' and '.'",
        ));
    }
    Ok(())
}

pub fn as_object(value: &Value) -> Result<&Map<String, Value>, ValidationError> {
    value.as_object().ok_or(ValidationError::NotAnObject)
}

pub fn required_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(ValidationError::invalid(field, "must be a string")),
    }
}

pub fn optional_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ValidationError::invalid(field, "must be a string")),
    }
}

pub fn required_timestamp(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<DateTime<Utc>, ValidationError> {
    let raw = required_str(obj, field)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ValidationError::invalid(field, format!("is not an RFC 3339 timestamp: {e}")))
}

/// Non-negative integer, defaulting to zero when absent.
pub fn optional_u64(obj: &Map<String, Value>, field: &'static str) -> Result<u64, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(0),
        Some(v) => v
            .as_u64()
            .ok_or_else(|| ValidationError::invalid(field, "must be a non-negative integer")),
    }
}
