use clap::Parser;
use common::{defaults, LeaseConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Parser, Debug, Clone)]
#[command(name = "gpulease-daemon", version, about = "On-instance lease daemon")]
pub struct DaemonConfig {
    /// Address of the control API.
    #[arg(long, env = "GPULEASE_LISTEN", default_value_t = SocketAddr::from(([0, 0, 0, 0], defaults::DAEMON_PORT)))]
    pub listen: SocketAddr,

    /// Shared bearer token for the control API and the watchdog.
    #[arg(long, env = "GPULEASE_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Provider id of the instance this daemon runs on.
    #[arg(long, env = "GPULEASE_INSTANCE_ID")]
    pub instance_id: String,

    #[arg(long, env = "GPULEASE_PROVIDER_API_KEY", hide_env_values = true)]
    pub provider_api_key: Option<String>,

    #[arg(long, env = "GPULEASE_PROVIDER_URL")]
    pub provider_url: Option<String>,

    /// Terminate against an in-memory provider instead of the real API.
    #[arg(long, env = "GPULEASE_MOCK")]
    pub mock: bool,

    /// Base URL of the external watchdog. Heartbeats are disabled without it.
    #[arg(long, env = "GPULEASE_WATCHDOG_URL")]
    pub watchdog_url: Option<String>,

    #[arg(long, env = "GPULEASE_LEASE_HOURS", default_value_t = defaults::INITIAL_LEASE_HOURS)]
    pub lease_hours: u32,

    #[arg(long, env = "GPULEASE_MAX_LEASE_HOURS", default_value_t = defaults::MAX_LEASE_HOURS)]
    pub max_lease_hours: u32,

    #[arg(long, env = "GPULEASE_IDLE_TIMEOUT_MINUTES", default_value_t = defaults::IDLE_TIMEOUT_MINUTES)]
    pub idle_timeout_minutes: u32,

    #[arg(long, env = "GPULEASE_CHECK_INTERVAL_SECS", default_value_t = defaults::CHECK_INTERVAL_SECS)]
    pub check_interval_secs: u64,

    #[arg(long, env = "GPULEASE_HEARTBEAT_INTERVAL_SECS", default_value_t = defaults::HEARTBEAT_INTERVAL_SECS)]
    pub heartbeat_interval_secs: u64,

    /// Staleness threshold the watchdog applies; used only to sanity-check the heartbeat interval.
    #[arg(long, env = "GPULEASE_STALE_THRESHOLD_SECS", default_value_t = defaults::STALE_THRESHOLD_SECS)]
    pub stale_threshold_secs: u64,

    /// SQLite file holding the lease record. Defaults to ~/.gpulease/daemon.db.
    #[arg(long, env = "GPULEASE_DAEMON_DB")]
    pub db: Option<PathBuf>,

    /// Prometheus endpoint of the served model, watched for request traffic.
    #[arg(long, env = "GPULEASE_ACTIVITY_PROBE_URL")]
    pub activity_probe_url: Option<String>,

    #[arg(long, env = "GPULEASE_ACTIVITY_METRIC", default_value = "sglang:num_requests_total")]
    pub activity_metric: String,

    #[arg(long, env = "GPULEASE_PROBE_SERVICE", default_value = "sglang")]
    pub probe_service: String,

    #[arg(long, env = "GPULEASE_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "GPULEASE_GPU_TYPE", default_value = "")]
    pub gpu_type: String,

    #[arg(long, env = "GPULEASE_REGION", default_value = "")]
    pub region: String,
}

impl DaemonConfig {
    pub fn lease(&self) -> LeaseConfig {
        LeaseConfig {
            initial_lease_hours: self.lease_hours,
            max_lease_hours: self.max_lease_hours,
            idle_timeout_minutes: self.idle_timeout_minutes,
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn db_path(&self) -> PathBuf {
        self.db.clone().unwrap_or_else(crate::db::default_db_path)
    }

    /// Refuse incoherent settings before anything starts.
    pub fn validate(&self) -> Result<(), String> {
        self.lease().validate()?;
        common::validate::validate_instance_id(&self.instance_id).map_err(|e| e.to_string())?;
        if self.token.trim().is_empty() {
            return Err("token must not be empty".to_string());
        }
        if !self.mock && self.provider_api_key.is_none() {
            return Err("a provider API key is required unless --mock is set".to_string());
        }
        if self.check_interval_secs == 0 || self.heartbeat_interval_secs == 0 {
            return Err("intervals must be positive".to_string());
        }
        let longest = [self.check_interval_secs, self.heartbeat_interval_secs, self.stale_threshold_secs];
        if longest.iter().any(|&secs| secs > defaults::MAX_CONFIGURED_SECS) {
            return Err(format!(
                "intervals and thresholds are limited to {}s",
                defaults::MAX_CONFIGURED_SECS
            ));
        }
        if self.stale_threshold_secs < self.heartbeat_interval_secs.saturating_mul(2) {
            return Err(format!(
                "heartbeat interval of {}s is too long for a {}s stale threshold",
                self.heartbeat_interval_secs, self.stale_threshold_secs
            ));
        }
        if self.stale_threshold_secs < self.heartbeat_interval_secs.saturating_mul(defaults::STALE_SAFETY_RATIO) {
            warn!(
                "Heartbeat interval {}s leaves less than a {}:1 margin against the {}s stale threshold",
                self.heartbeat_interval_secs,
                defaults::STALE_SAFETY_RATIO,
                self.stale_threshold_secs
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> DaemonConfig {
        let mut args = vec!["gpulease-daemon", "--token", "secret", "--instance-id", "i-1", "--mock"];
        args.extend_from_slice(extra);
        DaemonConfig::try_parse_from(args).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]);
        assert_eq!(config.listen.port(), defaults::DAEMON_PORT);
        assert_eq!(config.lease_hours, 4);
        assert_eq!(config.max_lease_hours, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn initial_lease_above_maximum_rejected() {
        let config = parse(&["--lease-hours", "9"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn heartbeat_interval_must_fit_stale_threshold() {
        let config = parse(&["--heartbeat-interval-secs", "200"]);
        assert!(config.validate().unwrap_err().contains("stale threshold"));
    }

    #[test]
    fn huge_intervals_rejected_without_overflow() {
        let max = u64::MAX.to_string();
        let config = parse(&["--heartbeat-interval-secs", &max]);
        assert!(config.validate().is_err());
        let config = parse(&["--heartbeat-interval-secs", &max, "--stale-threshold-secs", &max]);
        assert!(config.validate().unwrap_err().contains("limited"));
    }

    #[test]
    fn real_provider_needs_api_key() {
        let config = DaemonConfig::try_parse_from([
            "gpulease-daemon",
            "--token",
            "secret",
            "--instance-id",
            "i-1",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }
}
