use chrono::{DateTime, Duration, Utc};
use common::{defaults, Clock, HeartbeatRecord, SharedClock, TerminationEvent, TerminationReason};
use provider::{Instance, Provider, ProviderError, TerminateOutcome};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::events::EventLog;
use crate::heartbeats::HeartbeatRegistry;
use crate::store::{KvStore, StoreError};

const SEEN_KEY_PREFIX: &str = "seen:";
/// Marks an instance whose termination is already on record.
const DECIDED_KEY_PREFIX: &str = "decided:";

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub stale_threshold: Duration,
    pub boot_grace: Duration,
    pub fleet_marker: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::seconds(defaults::STALE_THRESHOLD_SECS as i64),
            boot_grace: Duration::seconds(defaults::BOOT_GRACE_SECS as i64),
            fleet_marker: defaults::FLEET_MARKER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// No heartbeat yet, still inside the boot grace period.
    Booting,
    Terminate(TerminationReason),
}

/// Decide the fate of one managed instance. `age` is measured from creation
/// (or first sighting) to `now`; staleness always uses `received_at`.
pub fn assess(
    age: Duration,
    heartbeat: Option<&HeartbeatRecord>,
    now: DateTime<Utc>,
    config: &SweepConfig,
) -> Verdict {
    match heartbeat {
        Some(record) if record.staleness(now) > config.stale_threshold => {
            Verdict::Terminate(TerminationReason::StaleHeartbeat)
        }
        Some(_) => Verdict::Healthy,
        None if age > config.boot_grace => Verdict::Terminate(TerminationReason::NoHeartbeat),
        None => Verdict::Booting,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("could not list instances: {0}")]
    Provider(#[from] ProviderError),
    #[error("could not read heartbeat store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub checked: usize,
    pub healthy: usize,
    pub booting: usize,
    pub unmanaged: usize,
    pub terminated: Vec<(String, TerminationReason)>,
    pub failed: Vec<(String, String)>,
}

/// One pass over the managed fleet.
pub struct Sweeper {
    provider: Arc<dyn Provider>,
    store: Arc<dyn KvStore>,
    heartbeats: HeartbeatRegistry,
    events: EventLog,
    clock: SharedClock,
    config: SweepConfig,
    seen_ttl: Duration,
}

impl Sweeper {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn KvStore>,
        heartbeats: HeartbeatRegistry,
        events: EventLog,
        clock: SharedClock,
        config: SweepConfig,
    ) -> Self {
        Self {
            provider,
            store,
            heartbeats,
            events,
            clock,
            config,
            seen_ttl: Duration::days(defaults::EVENT_TTL_DAYS),
        }
    }

    /// Run a sweep. Fails as a whole only when the fleet or the heartbeat
    /// store cannot be read; nothing is terminated in that case.
    pub async fn sweep(&self) -> Result<SweepReport, SweepError> {
        let instances = self.provider.list_instances().await?;
        let heartbeats = self.heartbeats.all().await?;
        let now = self.clock.now();

        let mut report = SweepReport::default();
        for instance in instances {
            if !instance.carries_marker(&self.config.fleet_marker) {
                report.unmanaged += 1;
                continue;
            }
            if instance.is_gone() {
                debug!("Skipping {} ({})", instance.id, instance.status);
                continue;
            }
            report.checked += 1;

            let age = match self.age(&instance, now).await {
                Ok(age) => age,
                Err(e) => {
                    warn!("Cannot determine age of {}: {}", instance.id, e);
                    report.failed.push((instance.id.clone(), e.to_string()));
                    continue;
                }
            };

            match assess(age, heartbeats.get(&instance.id), now, &self.config) {
                Verdict::Healthy => report.healthy += 1,
                Verdict::Booting => {
                    debug!(
                        "{} has not sent a heartbeat yet ({}s into the grace period)",
                        instance.id,
                        age.num_seconds()
                    );
                    report.booting += 1;
                }
                Verdict::Terminate(reason) => match self.terminate(&instance, reason, age, now).await {
                    Ok(()) => report.terminated.push((instance.id.clone(), reason)),
                    Err(e) => report.failed.push((instance.id.clone(), e.to_string())),
                },
            }
        }

        match self.store.purge_expired().await {
            Ok(0) => {}
            Ok(n) => debug!("Purged {} expired entries", n),
            Err(e) => warn!("Purging expired entries failed: {}", e),
        }
        Ok(report)
    }

    /// Same as `sweep`, with the outcome logged. Used by the scheduler.
    pub async fn run_once(&self) -> Option<SweepReport> {
        match self.sweep().await {
            Ok(report) => {
                info!(
                    "Sweep: {} checked, {} healthy, {} booting, {} unmanaged, {} terminated, {} failed",
                    report.checked,
                    report.healthy,
                    report.booting,
                    report.unmanaged,
                    report.terminated.len(),
                    report.failed.len()
                );
                for (id, reason) in &report.terminated {
                    warn!("Terminated {} ({})", id, reason);
                }
                for (id, e) in &report.failed {
                    error!("Could not handle {}: {}", id, e);
                }
                Some(report)
            }
            Err(e) => {
                error!("Sweep skipped: {}", e);
                None
            }
        }
    }

    /// Age from the provider's creation time, or from the first sweep that saw
    /// the instance when the provider does not report one.
    async fn age(&self, instance: &Instance, now: DateTime<Utc>) -> Result<Duration, StoreError> {
        if let Some(created_at) = instance.created_at {
            return Ok(now - created_at);
        }
        let key = format!("{}{}", SEEN_KEY_PREFIX, instance.id);
        if let Some(raw) = self.store.get(&key).await? {
            match DateTime::parse_from_rfc3339(&raw) {
                Ok(first_seen) => return Ok(now - first_seen.with_timezone(&Utc)),
                Err(e) => warn!("Resetting unreadable first-seen time of {}: {}", instance.id, e),
            }
        }
        self.store.put(&key, now.to_rfc3339(), Some(self.seen_ttl)).await?;
        Ok(Duration::zero())
    }

    /// Log first, then terminate. The audit record is kept even if the
    /// provider call fails; the next sweep retries.
    async fn terminate(
        &self,
        instance: &Instance,
        reason: TerminationReason,
        age: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), ProviderError> {
        warn!(
            "Terminating {} (reason: {}, age {}m)",
            instance.id,
            reason,
            age.num_minutes()
        );
        self.record_decision(instance, reason, age, now).await;

        match self.provider.terminate_instance(&instance.id).await? {
            TerminateOutcome::Terminated => info!("Provider accepted termination of {}", instance.id),
            TerminateOutcome::AlreadyGone => info!("{} was already gone", instance.id),
        }
        if let Err(e) = self.heartbeats.forget(&instance.id).await {
            debug!("Could not drop heartbeat of {}: {}", instance.id, e);
        }
        let _ = self
            .store
            .delete(&format!("{}{}", SEEN_KEY_PREFIX, instance.id))
            .await;
        Ok(())
    }

    /// Append the audit event once per instance. Retries of a failed
    /// terminate find the marker and do not log the decision again.
    async fn record_decision(
        &self,
        instance: &Instance,
        reason: TerminationReason,
        age: Duration,
        now: DateTime<Utc>,
    ) {
        let marker = format!("{}{}", DECIDED_KEY_PREFIX, instance.id);
        match self.store.get(&marker).await {
            Ok(Some(_)) => {
                info!("Termination of {} already on record; retrying", instance.id);
                return;
            }
            Ok(None) => {}
            Err(e) => debug!("Could not read decision marker of {}: {}", instance.id, e),
        }

        let event = TerminationEvent {
            timestamp: now,
            instance_id: instance.id.clone(),
            reason,
            uptime_minutes: age.num_minutes().max(0) as u64,
            gpu_type: instance.instance_type.clone(),
            region: instance.region.clone(),
        };
        match self.events.append(&event).await {
            Ok(key) => {
                if let Err(e) = self.store.put(&marker, key, Some(self.seen_ttl)).await {
                    warn!("Could not mark termination of {} as recorded: {}", instance.id, e);
                }
            }
            Err(e) => error!("Failed to record termination of {}: {}", instance.id, e),
        }
    }

    /// Run sweeps forever on a fixed schedule.
    pub fn start(self: Arc<Self>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Sweeper started (interval={}s)", interval.as_secs());
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use common::{HeartbeatPayload, ManualClock};
    use provider::MemoryProvider;
    use std::collections::BTreeMap;

    struct Harness {
        clock: Arc<ManualClock>,
        provider: Arc<MemoryProvider>,
        heartbeats: HeartbeatRegistry,
        events: EventLog,
        sweeper: Sweeper,
    }

    fn instance(id: &str, created_at: Option<DateTime<Utc>>, managed: bool) -> Instance {
        Instance {
            id: id.into(),
            name: None,
            ip: Some("10.1.0.1".into()),
            status: "active".into(),
            instance_type: "gpu_1x_h100".into(),
            region: "us-south-1".into(),
            file_system_names: if managed { vec!["gpulease".into()] } else { vec![] },
            created_at,
        }
    }

    fn harness(instances: Vec<Instance>, clock: Arc<ManualClock>) -> Harness {
        let provider = Arc::new(MemoryProvider::with_instances(instances));
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new(clock.clone()));
        let heartbeats = HeartbeatRegistry::new(store.clone(), clock.clone(), Duration::seconds(600));
        let events = EventLog::new(store.clone(), clock.clone(), Duration::days(90));
        let sweeper = Sweeper::new(
            provider.clone(),
            store,
            heartbeats.clone(),
            events.clone(),
            clock.clone(),
            SweepConfig::default(),
        );
        Harness {
            clock,
            provider,
            heartbeats,
            events,
            sweeper,
        }
    }

    async fn beat(h: &Harness, id: &str) {
        h.heartbeats
            .ingest(HeartbeatPayload {
                instance_id: id.into(),
                timestamp: h.clock.now(),
                uptime_minutes: 1,
                model_loaded: None,
                services: BTreeMap::new(),
                termination_reason: None,
            })
            .await
            .unwrap();
    }

    #[test]
    fn assess_boundaries() {
        let config = SweepConfig::default();
        let now = Utc::now();
        assert_eq!(assess(Duration::minutes(10), None, now, &config), Verdict::Booting);
        assert_eq!(
            assess(Duration::minutes(10) + Duration::seconds(1), None, now, &config),
            Verdict::Terminate(TerminationReason::NoHeartbeat)
        );
    }

    #[tokio::test]
    async fn silent_instance_terminated_after_grace() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let t = clock.now();
        let h = harness(vec![instance("i-1", Some(t), true)], clock);

        h.clock.advance(Duration::minutes(9));
        let report = h.sweeper.sweep().await.unwrap();
        assert_eq!(report.booting, 1);
        assert!(report.terminated.is_empty());

        h.clock.advance(Duration::minutes(2));
        let report = h.sweeper.sweep().await.unwrap();
        assert_eq!(report.terminated, vec![("i-1".to_string(), TerminationReason::NoHeartbeat)]);
        assert!(!h.provider.contains("i-1"));

        let logged = h.events.query(&Default::default()).await.unwrap();
        assert_eq!(logged.count, 1);
        assert_eq!(logged.events[0].reason, TerminationReason::NoHeartbeat);
        assert_eq!(logged.events[0].uptime_minutes, 11);
    }

    #[tokio::test]
    async fn stale_heartbeat_terminated() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let t = clock.now();
        let h = harness(vec![instance("i-1", Some(t), true)], clock);

        h.clock.advance(Duration::seconds(100));
        beat(&h, "i-1").await;

        h.clock.set(t + Duration::seconds(350));
        let report = h.sweeper.sweep().await.unwrap();
        assert_eq!(report.healthy, 1);
        assert!(h.provider.contains("i-1"));

        h.clock.set(t + Duration::seconds(450));
        let report = h.sweeper.sweep().await.unwrap();
        assert_eq!(report.terminated, vec![("i-1".to_string(), TerminationReason::StaleHeartbeat)]);
        assert!(!h.provider.contains("i-1"));
    }

    #[tokio::test]
    async fn unmanaged_and_gone_instances_untouched() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let t = clock.now();
        let mut gone = instance("i-gone", Some(t), true);
        gone.status = "terminating".into();
        let h = harness(vec![instance("i-other", Some(t), false), gone], clock);

        h.clock.advance(Duration::hours(5));
        let report = h.sweeper.sweep().await.unwrap();
        assert_eq!(report.unmanaged, 1);
        assert_eq!(report.checked, 0);
        assert!(h.provider.contains("i-other"));
        assert_eq!(h.provider.terminate_calls(), 0);
    }

    #[tokio::test]
    async fn missing_creation_time_aged_from_first_sighting() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let h = harness(vec![instance("i-1", None, true)], clock);

        assert_eq!(h.sweeper.sweep().await.unwrap().booting, 1);
        h.clock.advance(Duration::minutes(8));
        assert_eq!(h.sweeper.sweep().await.unwrap().booting, 1);
        h.clock.advance(Duration::minutes(3));
        let report = h.sweeper.sweep().await.unwrap();
        assert_eq!(report.terminated.len(), 1);
    }

    #[tokio::test]
    async fn failed_terminate_is_reported_and_retried() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let t = clock.now();
        let h = harness(vec![instance("i-1", Some(t), true)], clock);
        h.clock.advance(Duration::minutes(20));
        h.provider.fail_next_terminate(1);

        let report = h.sweeper.sweep().await.unwrap();
        assert!(report.terminated.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(h.provider.contains("i-1"));
        // the decision is on record even though the call failed
        assert_eq!(h.events.query(&Default::default()).await.unwrap().count, 1);

        let report = h.sweeper.sweep().await.unwrap();
        assert_eq!(report.terminated.len(), 1);
        assert!(!h.provider.contains("i-1"));
    }

    #[tokio::test]
    async fn retried_terminate_is_logged_once() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let t = clock.now();
        let h = harness(vec![instance("i-1", Some(t), true)], clock);
        h.clock.advance(Duration::minutes(20));
        h.provider.fail_next_terminate(2);

        for _ in 0..3 {
            h.sweeper.sweep().await.unwrap();
            h.clock.advance(Duration::minutes(5));
        }
        assert!(!h.provider.contains("i-1"));
        assert_eq!(h.provider.terminate_calls(), 3);

        let resp = h.events.query(&Default::default()).await.unwrap();
        assert_eq!(resp.count, 1);
        assert_eq!(resp.totals.uptime_minutes, 20);
    }

    #[tokio::test]
    async fn provider_outage_skips_the_sweep() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let t = clock.now();
        let h = harness(vec![instance("i-1", Some(t), true)], clock);
        h.clock.advance(Duration::hours(1));
        h.provider.fail_next(1);

        assert!(matches!(h.sweeper.sweep().await, Err(SweepError::Provider(_))));
        assert!(h.sweeper.run_once().await.is_some());
        assert!(!h.provider.contains("i-1"));
    }

    struct BrokenStore;

    #[async_trait]
    impl KvStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend("offline".into()))
        }
        async fn put(&self, _key: &str, _value: String, _ttl: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Backend("offline".into()))
        }
        async fn list_prefix(&self, _prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
            Err(StoreError::Backend("offline".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("offline".into()))
        }
        async fn purge_expired(&self) -> Result<usize, StoreError> {
            Err(StoreError::Backend("offline".into()))
        }
    }

    #[tokio::test]
    async fn store_outage_terminates_nothing() {
        let clock: SharedClock = Arc::new(ManualClock::new(Utc::now()));
        let t = clock.now() - Duration::hours(2);
        let provider = Arc::new(MemoryProvider::with_instances([instance("i-1", Some(t), true)]));
        let store: Arc<dyn KvStore> = Arc::new(BrokenStore);
        let sweeper = Sweeper::new(
            provider.clone(),
            store.clone(),
            HeartbeatRegistry::new(store.clone(), clock.clone(), Duration::seconds(600)),
            EventLog::new(store, clock.clone(), Duration::days(90)),
            clock,
            SweepConfig::default(),
        );

        assert!(matches!(sweeper.sweep().await, Err(SweepError::Store(_))));
        assert!(sweeper.run_once().await.is_none());
        assert_eq!(provider.terminate_calls(), 0);
    }
}
