use chrono::Duration;
use clap::Parser;
use common::defaults;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::warn;

use crate::sweep::SweepConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "gpulease-watchdog", version, about = "External heartbeat watchdog for leased GPU instances")]
pub struct WatchdogConfig {
    #[arg(long, env = "GPULEASE_WATCHDOG_LISTEN", default_value_t = SocketAddr::from(([0, 0, 0, 0], defaults::WATCHDOG_PORT)))]
    pub listen: SocketAddr,

    /// Shared bearer token expected from daemons and the operator client.
    #[arg(long, env = "GPULEASE_TOKEN", hide_env_values = true)]
    pub token: String,

    #[arg(long, env = "GPULEASE_PROVIDER_API_KEY", hide_env_values = true)]
    pub provider_api_key: Option<String>,

    #[arg(long, env = "GPULEASE_PROVIDER_URL")]
    pub provider_url: Option<String>,

    /// Sweep an in-memory provider instead of the real API.
    #[arg(long, env = "GPULEASE_MOCK")]
    pub mock: bool,

    /// SQLite file for heartbeats and events. Defaults to ~/.gpulease/watchdog.db.
    #[arg(long, env = "GPULEASE_WATCHDOG_DB", conflicts_with = "memory")]
    pub db: Option<PathBuf>,

    /// Keep all state in memory.
    #[arg(long)]
    pub memory: bool,

    /// Run a single sweep and exit.
    #[arg(long)]
    pub once: bool,

    #[arg(long, env = "GPULEASE_SWEEP_INTERVAL_SECS", default_value_t = defaults::SWEEP_INTERVAL_SECS)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "GPULEASE_STALE_THRESHOLD_SECS", default_value_t = defaults::STALE_THRESHOLD_SECS)]
    pub stale_threshold_secs: u64,

    /// Expected daemon heartbeat interval, checked against the stale threshold.
    #[arg(long, env = "GPULEASE_HEARTBEAT_INTERVAL_SECS", default_value_t = defaults::HEARTBEAT_INTERVAL_SECS)]
    pub heartbeat_interval_secs: u64,

    #[arg(long, env = "GPULEASE_BOOT_GRACE_SECS", default_value_t = defaults::BOOT_GRACE_SECS)]
    pub boot_grace_secs: u64,

    /// Defaults to twice the stale threshold.
    #[arg(long, env = "GPULEASE_HEARTBEAT_TTL_SECS")]
    pub heartbeat_ttl_secs: Option<u64>,

    #[arg(long, env = "GPULEASE_EVENT_TTL_DAYS", default_value_t = defaults::EVENT_TTL_DAYS)]
    pub event_ttl_days: i64,

    /// Attached filesystem name that marks an instance as managed.
    #[arg(long, env = "GPULEASE_FLEET_MARKER", default_value = defaults::FLEET_MARKER)]
    pub fleet_marker: String,
}

impl WatchdogConfig {
    pub fn sweep(&self) -> SweepConfig {
        SweepConfig {
            stale_threshold: Duration::seconds(self.stale_threshold_secs as i64),
            boot_grace: Duration::seconds(self.boot_grace_secs as i64),
            fleet_marker: self.fleet_marker.clone(),
        }
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        let secs = self
            .heartbeat_ttl_secs
            .unwrap_or(self.stale_threshold_secs.saturating_mul(2))
            .min(2 * defaults::MAX_CONFIGURED_SECS);
        Duration::seconds(secs as i64)
    }

    pub fn event_ttl(&self) -> Duration {
        Duration::days(self.event_ttl_days)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.token.trim().is_empty() {
            return Err("token must not be empty".to_string());
        }
        if !self.mock && self.provider_api_key.is_none() {
            return Err("a provider API key is required unless --mock is set".to_string());
        }
        if self.sweep_interval_secs == 0 || self.heartbeat_interval_secs == 0 {
            return Err("intervals must be positive".to_string());
        }
        let configured = [
            self.sweep_interval_secs,
            self.heartbeat_interval_secs,
            self.stale_threshold_secs,
            self.boot_grace_secs,
            self.heartbeat_ttl_secs.unwrap_or(0),
        ];
        if configured.iter().any(|&secs| secs > defaults::MAX_CONFIGURED_SECS) {
            return Err(format!(
                "intervals, thresholds and TTLs are limited to {}s",
                defaults::MAX_CONFIGURED_SECS
            ));
        }
        if self.fleet_marker.trim().is_empty() {
            return Err("fleet marker must not be empty".to_string());
        }
        if self.stale_threshold_secs < self.heartbeat_interval_secs.saturating_mul(2) {
            return Err(format!(
                "stale threshold of {}s must be at least twice the {}s heartbeat interval",
                self.stale_threshold_secs, self.heartbeat_interval_secs
            ));
        }
        if self.heartbeat_ttl_secs.is_some_and(|ttl| ttl <= self.stale_threshold_secs) {
            return Err("heartbeat TTL must outlive the stale threshold".to_string());
        }
        if self.event_ttl_days <= 0 || self.event_ttl_days > defaults::MAX_EVENT_TTL_DAYS {
            return Err(format!(
                "event TTL must be between 1 and {} days",
                defaults::MAX_EVENT_TTL_DAYS
            ));
        }
        if self.stale_threshold_secs < self.heartbeat_interval_secs.saturating_mul(defaults::STALE_SAFETY_RATIO) {
            warn!(
                "Stale threshold {}s is less than {}x the {}s heartbeat interval; expect false positives",
                self.stale_threshold_secs,
                defaults::STALE_SAFETY_RATIO,
                self.heartbeat_interval_secs
            );
        }
        Ok(())
    }
}
