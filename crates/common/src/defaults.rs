//! Default values shared by the daemon, the watchdog and the operator client.

/// Absolute lifetime ceiling of an instance, counted from daemon start.
pub const MAX_LEASE_HOURS: u32 = 8;
/// Lease granted at launch, before any extension.
pub const INITIAL_LEASE_HOURS: u32 = 4;
pub const IDLE_TIMEOUT_MINUTES: u32 = 30;

/// How often the daemon re-evaluates its lease.
pub const CHECK_INTERVAL_SECS: u64 = 60;
/// How often the daemon pushes a heartbeat to the watchdog.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// Heartbeats older than this (by the watchdog's clock) are stale.
pub const STALE_THRESHOLD_SECS: u64 = 300;
/// Minimum ratio between stale threshold and heartbeat interval before a warning is logged.
pub const STALE_SAFETY_RATIO: u64 = 4;
/// A managed instance may go this long after creation without a first heartbeat.
pub const BOOT_GRACE_SECS: u64 = 600;
/// Heartbeat records expire from the hot store after this long.
pub const HEARTBEAT_TTL_SECS: u64 = 2 * STALE_THRESHOLD_SECS;
pub const EVENT_TTL_DAYS: i64 = 90;
/// Upper bound on any configured interval, threshold or TTL in seconds.
pub const MAX_CONFIGURED_SECS: u64 = 30 * 24 * 3600;
/// Upper bound on the event retention window.
pub const MAX_EVENT_TTL_DAYS: i64 = 10 * 365;
pub const SWEEP_INTERVAL_SECS: u64 = 300;

pub const DAEMON_PORT: u16 = 8080;
pub const WATCHDOG_PORT: u16 = 8787;

/// Attached filesystem name that marks an instance as managed.
pub const FLEET_MARKER: &str = "gpulease";

pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 1000;
pub const RETRY_BACKOFF_MULTIPLIER: u32 = 2;

pub const EVENTS_DEFAULT_HOURS: i64 = 24;
pub const EVENTS_DEFAULT_LIMIT: usize = 100;
pub const EVENTS_MAX_LIMIT: usize = 1000;
