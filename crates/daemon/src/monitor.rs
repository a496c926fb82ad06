use common::{Clock, SharedClock, TerminationReason};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::keeper::LeaseKeeper;
use crate::terminate::Terminator;

/// Background loop that enforces the lease locally.
pub struct LeaseMonitor {
    keeper: Arc<LeaseKeeper>,
    terminator: Arc<Terminator>,
    clock: SharedClock,
    check_interval: Duration,
}

impl LeaseMonitor {
    pub fn new(
        keeper: Arc<LeaseKeeper>,
        terminator: Arc<Terminator>,
        clock: SharedClock,
        check_interval: Duration,
    ) -> Self {
        Self {
            keeper,
            terminator,
            clock,
            check_interval,
        }
    }

    /// One pass. A termination already committed is retried before anything
    /// else is evaluated. Returns the reason acted on, if any.
    pub async fn check(&self) -> Option<TerminationReason> {
        let now = self.clock.now();
        let Some((reason, first)) = self.keeper.evaluate_and_commit(now) else {
            let snap = self.keeper.snapshot(now);
            debug!(
                "Lease ok: {}m remaining, idle {}m/{}m",
                snap.remaining_minutes, snap.idle_minutes, snap.idle_timeout_minutes
            );
            return None;
        };
        // Errors are logged by the terminator and retried next tick.
        let _ = self.terminator.run_committed(reason, first).await;
        Some(reason)
    }

    /// Start the loop as a background task. It ends once termination is confirmed.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Lease monitor started (interval={}s)",
                self.check_interval.as_secs()
            );
            let mut interval = tokio::time::interval(self.check_interval);
            loop {
                interval.tick().await;
                self.check().await;
                if self.terminator.is_done() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::{Duration as ChronoDuration, Utc};
    use common::{Clock, LeaseConfig, ManualClock};
    use provider::{Instance, MemoryProvider};

    struct Harness {
        clock: Arc<ManualClock>,
        keeper: Arc<LeaseKeeper>,
        provider: Arc<MemoryProvider>,
        monitor: LeaseMonitor,
    }

    fn harness(initial_hours: u32) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let provider = Arc::new(MemoryProvider::with_instances([Instance {
            id: "i-1".into(),
            name: None,
            ip: Some("10.0.0.3".into()),
            status: "active".into(),
            instance_type: "gpu_1x_a10".into(),
            region: "us-west-1".into(),
            file_system_names: vec![],
            created_at: None,
        }]));
        let config = LeaseConfig {
            initial_lease_hours: initial_hours,
            max_lease_hours: 8,
            idle_timeout_minutes: 30,
        };
        let keeper = Arc::new(
            LeaseKeeper::open(db::init_in_memory().unwrap(), "i-1", &config, clock.now()).unwrap(),
        );
        let terminator = Arc::new(Terminator::new(keeper.clone(), provider.clone(), clock.clone()));
        let monitor = LeaseMonitor::new(keeper.clone(), terminator, clock.clone(), Duration::from_secs(60));
        Harness {
            clock,
            keeper,
            provider,
            monitor,
        }
    }

    #[tokio::test]
    async fn idle_instance_is_terminated() {
        let h = harness(4);
        h.clock.advance(ChronoDuration::minutes(29));
        assert_eq!(h.monitor.check().await, None);
        h.clock.advance(ChronoDuration::minutes(1));
        assert_eq!(h.monitor.check().await, Some(TerminationReason::IdleTimeout));
        assert!(!h.provider.contains("i-1"));
    }

    #[tokio::test]
    async fn activity_postpones_idle_timeout() {
        let h = harness(4);
        h.clock.advance(ChronoDuration::minutes(20));
        h.keeper.record_activity(h.clock.now()).unwrap();
        h.clock.advance(ChronoDuration::minutes(29));
        assert_eq!(h.monitor.check().await, None);
        h.clock.advance(ChronoDuration::minutes(1));
        assert_eq!(h.monitor.check().await, Some(TerminationReason::IdleTimeout));
    }

    #[tokio::test]
    async fn hard_timeout_reported_when_everything_expired() {
        let h = harness(2);
        h.clock.advance(ChronoDuration::hours(9));
        assert_eq!(h.monitor.check().await, Some(TerminationReason::HardTimeout));
        assert_eq!(h.keeper.pending_shutdown(), Some(TerminationReason::HardTimeout));
    }

    #[tokio::test]
    async fn failed_termination_retried_next_tick() {
        let h = harness(1);
        h.provider.fail_next(1);
        h.clock.advance(ChronoDuration::minutes(61));
        assert_eq!(h.monitor.check().await, Some(TerminationReason::LeaseExpired));
        assert!(h.provider.contains("i-1"));

        // Activity is refused once shutting down, and the next tick retries.
        assert!(h.keeper.record_activity(h.clock.now()).is_err());
        assert_eq!(h.monitor.check().await, Some(TerminationReason::LeaseExpired));
        assert!(!h.provider.contains("i-1"));
    }
}
