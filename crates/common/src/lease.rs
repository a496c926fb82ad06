use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::defaults;

/// Why an instance was (or is being) terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    LeaseExpired,
    IdleTimeout,
    HardTimeout,
    StaleHeartbeat,
    NoHeartbeat,
    Manual,
}

impl TerminationReason {
    pub const ALL: [TerminationReason; 6] = [
        TerminationReason::LeaseExpired,
        TerminationReason::IdleTimeout,
        TerminationReason::HardTimeout,
        TerminationReason::StaleHeartbeat,
        TerminationReason::NoHeartbeat,
        TerminationReason::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::LeaseExpired => "lease_expired",
            TerminationReason::IdleTimeout => "idle_timeout",
            TerminationReason::HardTimeout => "hard_timeout",
            TerminationReason::StaleHeartbeat => "stale_heartbeat",
            TerminationReason::NoHeartbeat => "no_heartbeat",
            TerminationReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase of the daemon. There is no way back from `ShuttingDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeasePhase {
    Running,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LeaseError {
    #[error("hours must be a positive integer (got {0})")]
    InvalidHours(i64),
    #[error(
        "extension of {requested_hours}h would exceed {max_lease_hours}-hour maximum; {available_hours:.1} hours still available"
    )]
    ExceedsMaximum {
        requested_hours: i64,
        max_lease_hours: u32,
        available_hours: f64,
    },
    #[error("instance is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    pub initial_lease_hours: u32,
    pub max_lease_hours: u32,
    pub idle_timeout_minutes: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            initial_lease_hours: defaults::INITIAL_LEASE_HOURS,
            max_lease_hours: defaults::MAX_LEASE_HOURS,
            idle_timeout_minutes: defaults::IDLE_TIMEOUT_MINUTES,
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_lease_hours == 0 {
            return Err("max lease hours must be positive".to_string());
        }
        if self.initial_lease_hours == 0 {
            return Err("initial lease hours must be positive".to_string());
        }
        if self.initial_lease_hours > self.max_lease_hours {
            return Err(format!(
                "initial lease of {}h exceeds the {}h maximum",
                self.initial_lease_hours, self.max_lease_hours
            ));
        }
        if self.idle_timeout_minutes == 0 {
            return Err("idle timeout must be positive".to_string());
        }
        Ok(())
    }
}

/// The authoritative lease record of one instance.
///
/// Only the daemon running on the instance mutates this. Callers are
/// expected to hold it behind a single lock so that `extend` can check the
/// ceiling and move the deadline in one critical section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseState {
    pub instance_id: String,
    pub created_at: DateTime<Utc>,
    pub lease_deadline: DateTime<Utc>,
    pub max_lease_hours: u32,
    pub last_activity_at: DateTime<Utc>,
    pub idle_timeout_minutes: u32,
    pub extension_count: u32,
    pub termination_reason: Option<TerminationReason>,
}

impl LeaseState {
    pub fn new(instance_id: impl Into<String>, created_at: DateTime<Utc>, config: &LeaseConfig) -> Self {
        let initial = config.initial_lease_hours.min(config.max_lease_hours);
        Self {
            instance_id: instance_id.into(),
            created_at,
            lease_deadline: created_at + Duration::hours(i64::from(initial)),
            max_lease_hours: config.max_lease_hours,
            last_activity_at: created_at,
            idle_timeout_minutes: config.idle_timeout_minutes,
            extension_count: 0,
            termination_reason: None,
        }
    }

    /// `created_at + max_lease_hours`. Nothing moves this.
    pub fn hard_deadline(&self) -> DateTime<Utc> {
        self.created_at + Duration::hours(i64::from(self.max_lease_hours))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::minutes(i64::from(self.idle_timeout_minutes))
    }

    pub fn phase(&self) -> LeasePhase {
        if self.termination_reason.is_some() {
            LeasePhase::ShuttingDown
        } else {
            LeasePhase::Running
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.termination_reason.is_some()
    }

    /// Decide whether the instance must go, checking in priority order:
    /// hard timeout, then lease expiry, then idleness.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Option<TerminationReason> {
        if now >= self.hard_deadline() {
            Some(TerminationReason::HardTimeout)
        } else if now >= self.lease_deadline {
            Some(TerminationReason::LeaseExpired)
        } else if now - self.last_activity_at >= self.idle_timeout() {
            Some(TerminationReason::IdleTimeout)
        } else {
            None
        }
    }

    /// Time left before the deadline would hit the hard ceiling.
    pub fn available_extension(&self) -> Duration {
        (self.hard_deadline() - self.lease_deadline).max(Duration::zero())
    }

    pub fn available_extension_hours(&self) -> f64 {
        self.available_extension().num_seconds() as f64 / 3600.0
    }

    /// Compute the deadline an extension would produce, without applying it.
    pub fn check_extend(&self, hours: i64) -> Result<DateTime<Utc>, LeaseError> {
        if self.is_shutting_down() {
            return Err(LeaseError::ShuttingDown);
        }
        if hours <= 0 {
            return Err(LeaseError::InvalidHours(hours));
        }
        let exceeds = || LeaseError::ExceedsMaximum {
            requested_hours: hours,
            max_lease_hours: self.max_lease_hours,
            available_hours: self.available_extension_hours(),
        };
        let by = Duration::try_hours(hours).ok_or_else(exceeds)?;
        let new_deadline = self
            .lease_deadline
            .checked_add_signed(by)
            .ok_or_else(exceeds)?;
        if new_deadline > self.hard_deadline() {
            return Err(exceeds());
        }
        Ok(new_deadline)
    }

    /// Push the deadline out by `hours`. Leaves the state untouched on error.
    pub fn extend(&mut self, hours: i64) -> Result<DateTime<Utc>, LeaseError> {
        let new_deadline = self.check_extend(hours)?;
        self.lease_deadline = new_deadline;
        self.extension_count += 1;
        Ok(new_deadline)
    }

    /// Reset the idle clock. Timestamps older than the current one are ignored.
    pub fn record_activity(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity_at {
            self.last_activity_at = at;
        }
        debug_assert!(self.created_at <= self.last_activity_at);
    }

    /// Commit to termination. Returns `true` only for the call that made the
    /// transition; later reasons are ignored.
    pub fn begin_shutdown(&mut self, reason: TerminationReason) -> bool {
        if self.termination_reason.is_some() {
            return false;
        }
        self.termination_reason = Some(reason);
        true
    }

    pub fn uptime_minutes(&self, now: DateTime<Utc>) -> u64 {
        (now - self.created_at).num_minutes().max(0) as u64
    }

    pub fn total_hours(&self) -> f64 {
        (self.lease_deadline - self.created_at).num_seconds() as f64 / 3600.0
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> LeaseSnapshot {
        LeaseSnapshot {
            instance_id: self.instance_id.clone(),
            state: self.phase(),
            created_at: self.created_at,
            lease_deadline: self.lease_deadline,
            hard_deadline: self.hard_deadline(),
            uptime_minutes: self.uptime_minutes(now),
            remaining_minutes: (self.lease_deadline - now).num_minutes().max(0),
            idle_minutes: (now - self.last_activity_at).num_minutes().max(0),
            idle_timeout_minutes: self.idle_timeout_minutes,
            max_lease_hours: self.max_lease_hours,
            extension_count: self.extension_count,
            available_extension_hours: self.available_extension_hours(),
            last_activity_at: self.last_activity_at,
            termination_reason: self.termination_reason,
        }
    }
}

/// Read-only view served by the daemon's `/status` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseSnapshot {
    pub instance_id: String,
    pub state: LeasePhase,
    pub created_at: DateTime<Utc>,
    pub lease_deadline: DateTime<Utc>,
    pub hard_deadline: DateTime<Utc>,
    pub uptime_minutes: u64,
    pub remaining_minutes: i64,
    pub idle_minutes: i64,
    pub idle_timeout_minutes: u32,
    pub max_lease_hours: u32,
    pub extension_count: u32,
    pub available_extension_hours: f64,
    pub last_activity_at: DateTime<Utc>,
    pub termination_reason: Option<TerminationReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn config(initial: u32) -> LeaseConfig {
        LeaseConfig {
            initial_lease_hours: initial,
            max_lease_hours: 8,
            idle_timeout_minutes: 30,
        }
    }

    #[test]
    fn extension_scenario_respects_ceiling() {
        let mut lease = LeaseState::new("i-1", t0(), &config(1));

        let deadline = lease.extend(4).unwrap();
        assert_eq!(deadline, t0() + Duration::hours(5));

        let err = lease.extend(5).unwrap_err();
        match err {
            LeaseError::ExceedsMaximum { available_hours, .. } => {
                assert!((available_hours - 3.0).abs() < f64::EPSILON)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(lease.lease_deadline, t0() + Duration::hours(5));
        assert_eq!(lease.extension_count, 1);
    }

    #[test]
    fn exceeds_message_names_remaining_hours() {
        let lease = LeaseState {
            lease_deadline: t0() + Duration::minutes(390),
            ..LeaseState::new("i-1", t0(), &config(1))
        };
        let msg = lease.check_extend(2).unwrap_err().to_string();
        assert!(msg.contains("8-hour maximum"), "{msg}");
        assert!(msg.contains("1.5 hours still available"), "{msg}");
    }

    #[test]
    fn non_positive_hours_rejected() {
        let mut lease = LeaseState::new("i-1", t0(), &config(1));
        assert_eq!(lease.extend(0), Err(LeaseError::InvalidHours(0)));
        assert_eq!(lease.extend(-3), Err(LeaseError::InvalidHours(-3)));
        assert_eq!(lease.lease_deadline, t0() + Duration::hours(1));
    }

    #[test]
    fn huge_hours_do_not_overflow() {
        let mut lease = LeaseState::new("i-1", t0(), &config(1));
        assert!(matches!(
            lease.extend(i64::MAX),
            Err(LeaseError::ExceedsMaximum { .. })
        ));
    }

    #[test]
    fn hard_timeout_wins_over_everything() {
        let lease = LeaseState::new("i-1", t0(), &config(4));
        let now = t0() + Duration::hours(9);
        assert_eq!(lease.evaluate(now), Some(TerminationReason::HardTimeout));
    }

    #[test]
    fn lease_expiry_beats_idle() {
        let lease = LeaseState::new("i-1", t0(), &config(1));
        let now = t0() + Duration::minutes(61);
        assert_eq!(lease.evaluate(now), Some(TerminationReason::LeaseExpired));
    }

    #[test]
    fn idle_measured_from_last_activity() {
        let mut lease = LeaseState::new("i-1", t0(), &config(4));
        lease.record_activity(t0() + Duration::minutes(20));

        assert_eq!(lease.evaluate(t0() + Duration::minutes(31)), None);
        assert_eq!(lease.evaluate(t0() + Duration::minutes(49)), None);
        assert_eq!(
            lease.evaluate(t0() + Duration::minutes(50)),
            Some(TerminationReason::IdleTimeout)
        );
    }

    #[test]
    fn older_activity_does_not_rewind_clock() {
        let mut lease = LeaseState::new("i-1", t0(), &config(4));
        lease.record_activity(t0() + Duration::minutes(10));
        lease.record_activity(t0() + Duration::minutes(5));
        assert_eq!(lease.last_activity_at, t0() + Duration::minutes(10));
    }

    #[test]
    fn shutdown_keeps_first_reason() {
        let mut lease = LeaseState::new("i-1", t0(), &config(4));
        assert!(lease.begin_shutdown(TerminationReason::IdleTimeout));
        assert!(!lease.begin_shutdown(TerminationReason::Manual));
        assert_eq!(lease.termination_reason, Some(TerminationReason::IdleTimeout));
        assert_eq!(lease.phase(), LeasePhase::ShuttingDown);
        assert_eq!(lease.extend(1), Err(LeaseError::ShuttingDown));
    }

    #[test]
    fn initial_lease_clamped_to_maximum() {
        let cfg = LeaseConfig {
            initial_lease_hours: 12,
            max_lease_hours: 8,
            idle_timeout_minutes: 30,
        };
        assert!(cfg.validate().is_err());
        let lease = LeaseState::new("i-1", t0(), &cfg);
        assert_eq!(lease.lease_deadline, lease.hard_deadline());
    }

    #[test]
    fn snapshot_reports_progress() {
        let lease = LeaseState::new("i-1", t0(), &config(4));
        let snap = lease.snapshot(t0() + Duration::minutes(90));
        assert_eq!(snap.uptime_minutes, 90);
        assert_eq!(snap.remaining_minutes, 150);
        assert_eq!(snap.idle_minutes, 90);
        assert_eq!(snap.state, LeasePhase::Running);
        assert!((snap.available_extension_hours - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reason_round_trips_through_str() {
        for reason in TerminationReason::ALL {
            assert_eq!(TerminationReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(TerminationReason::parse("bogus"), None);
    }

    proptest! {
        /// Property: no interleaving of extensions moves the deadline past the ceiling,
        /// and a rejected extension leaves the deadline where it was.
        #[test]
        fn prop_deadline_never_crosses_ceiling(
            initial in 1u32..=8,
            requests in prop::collection::vec(1i64..=10, 0..20),
        ) {
            let mut lease = LeaseState::new("i-prop", t0(), &config(initial));
            let ceiling = lease.hard_deadline();

            for hours in requests {
                let before = lease.lease_deadline;
                match lease.extend(hours) {
                    Ok(deadline) => {
                        prop_assert_eq!(deadline, before + Duration::hours(hours));
                    }
                    Err(LeaseError::ExceedsMaximum { .. }) => {
                        prop_assert!(before + Duration::hours(hours) > ceiling);
                        prop_assert_eq!(lease.lease_deadline, before);
                    }
                    Err(other) => prop_assert!(false, "unexpected error {:?}", other),
                }
                prop_assert!(lease.lease_deadline <= ceiling);
            }
        }
    }
}
