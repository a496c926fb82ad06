use chrono::{DateTime, Utc};
use common::{LeaseState, TerminationReason};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result};
use std::fs;
use std::path::{Path, PathBuf};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS leases (
    instance_id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    lease_deadline TEXT NOT NULL,
    max_lease_hours INTEGER NOT NULL,
    last_activity_at TEXT NOT NULL,
    idle_timeout_minutes INTEGER NOT NULL,
    extension_count INTEGER NOT NULL,
    termination_reason TEXT
);
"#;

/// Initialize the database at the given path, creating the directory if needed.
pub fn init_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

pub fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Get the default database path (~/.gpulease/daemon.db)
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gpulease")
        .join("daemon.db")
}

fn parse_ts(idx: usize, raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Load the stored lease for an instance, if this daemon has run before.
pub fn load_lease(conn: &Connection, instance_id: &str) -> Result<Option<LeaseState>> {
    conn.query_row(
        "SELECT instance_id, created_at, lease_deadline, max_lease_hours, last_activity_at, idle_timeout_minutes, extension_count, termination_reason FROM leases WHERE instance_id = ?1",
        params![instance_id],
        |row| {
            let reason: Option<String> = row.get(7)?;
            let termination_reason = match reason {
                None => None,
                Some(raw) => Some(TerminationReason::parse(&raw).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        7,
                        Type::Text,
                        format!("unknown termination reason '{raw}'").into(),
                    )
                })?),
            };
            Ok(LeaseState {
                instance_id: row.get(0)?,
                created_at: parse_ts(1, row.get(1)?)?,
                lease_deadline: parse_ts(2, row.get(2)?)?,
                max_lease_hours: row.get(3)?,
                last_activity_at: parse_ts(4, row.get(4)?)?,
                idle_timeout_minutes: row.get(5)?,
                extension_count: row.get(6)?,
                termination_reason,
            })
        },
    )
    .optional()
}

/// Save the full lease record.
pub fn save_lease(conn: &Connection, lease: &LeaseState) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO leases (instance_id, created_at, lease_deadline, max_lease_hours, last_activity_at, idle_timeout_minutes, extension_count, termination_reason) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            lease.instance_id,
            lease.created_at.to_rfc3339(),
            lease.lease_deadline.to_rfc3339(),
            lease.max_lease_hours,
            lease.last_activity_at.to_rfc3339(),
            lease.idle_timeout_minutes,
            lease.extension_count,
            lease.termination_reason.map(|r| r.as_str()),
        ],
    )?;
    Ok(())
}

/// Update only the activity timestamp.
pub fn update_activity(conn: &Connection, instance_id: &str, at: DateTime<Utc>) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE leases SET last_activity_at = ?1 WHERE instance_id = ?2",
        params![at.to_rfc3339(), instance_id],
    )?;
    Ok(rows > 0)
}
