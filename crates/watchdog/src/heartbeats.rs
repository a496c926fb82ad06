use chrono::Duration;
use common::{Clock, HeartbeatPayload, HeartbeatRecord, SharedClock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::{KvStore, StoreError};

pub const HEARTBEAT_KEY_PREFIX: &str = "heartbeat:";

pub fn heartbeat_key(instance_id: &str) -> String {
    format!("{}{}", HEARTBEAT_KEY_PREFIX, instance_id)
}

/// Hot store of the latest heartbeat per instance.
#[derive(Clone)]
pub struct HeartbeatRegistry {
    store: Arc<dyn KvStore>,
    clock: SharedClock,
    ttl: Duration,
}

impl HeartbeatRegistry {
    pub fn new(store: Arc<dyn KvStore>, clock: SharedClock, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    /// Stamp `received_at` with our own clock and overwrite the previous record.
    pub async fn ingest(&self, payload: HeartbeatPayload) -> Result<(String, HeartbeatRecord), StoreError> {
        let record = payload.into_record(self.clock.now());
        let key = heartbeat_key(&record.instance_id);
        let value = serde_json::to_string(&record).map_err(|source| StoreError::Corrupt {
            key: key.clone(),
            source,
        })?;
        self.store.put(&key, value, Some(self.ttl)).await?;
        debug!(
            "Heartbeat from {} (uptime {}m)",
            record.instance_id, record.uptime_minutes
        );
        Ok((key, record))
    }

    pub async fn get(&self, instance_id: &str) -> Result<Option<HeartbeatRecord>, StoreError> {
        let key = heartbeat_key(instance_id);
        match self.store.get(&key).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::Corrupt { key, source }),
        }
    }

    /// Every live record, keyed by instance id. Unreadable entries are skipped.
    pub async fn all(&self) -> Result<BTreeMap<String, HeartbeatRecord>, StoreError> {
        let mut out = BTreeMap::new();
        for (key, raw) in self.store.list_prefix(HEARTBEAT_KEY_PREFIX).await? {
            match serde_json::from_str::<HeartbeatRecord>(&raw) {
                Ok(record) => {
                    out.insert(record.instance_id.clone(), record);
                }
                Err(e) => warn!("Skipping unreadable heartbeat under {}: {}", key, e),
            }
        }
        Ok(out)
    }

    pub async fn forget(&self, instance_id: &str) -> Result<(), StoreError> {
        self.store.delete(&heartbeat_key(instance_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use common::ManualClock;

    fn payload(id: &str, timestamp: chrono::DateTime<Utc>) -> HeartbeatPayload {
        HeartbeatPayload {
            instance_id: id.into(),
            timestamp,
            uptime_minutes: 5,
            model_loaded: Some("llama-3-8b".into()),
            services: BTreeMap::new(),
            termination_reason: None,
        }
    }

    fn registry(clock: Arc<ManualClock>) -> HeartbeatRegistry {
        let store = Arc::new(MemoryStore::new(clock.clone()));
        HeartbeatRegistry::new(store, clock, Duration::seconds(600))
    }

    #[tokio::test]
    async fn receiver_clock_wins_over_producer_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = registry(clock.clone());
        let skewed = clock.now() + Duration::hours(3);

        let (key, record) = registry.ingest(payload("i-1", skewed)).await.unwrap();
        assert_eq!(key, "heartbeat:i-1");
        assert_eq!(record.sent_at, skewed);
        assert_eq!(record.received_at, clock.now());

        clock.advance(Duration::seconds(400));
        let stored = registry.get("i-1").await.unwrap().unwrap();
        assert_eq!(stored.staleness(clock.now()), Duration::seconds(400));
    }

    #[tokio::test]
    async fn latest_heartbeat_overwrites() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = registry(clock.clone());
        registry.ingest(payload("i-1", clock.now())).await.unwrap();
        clock.advance(Duration::seconds(60));
        registry.ingest(payload("i-1", clock.now())).await.unwrap();
        registry.ingest(payload("i-2", clock.now())).await.unwrap();

        let all = registry.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["i-1"].received_at, clock.now());
    }

    #[tokio::test]
    async fn records_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = registry(clock.clone());
        registry.ingest(payload("i-1", clock.now())).await.unwrap();
        clock.advance(Duration::seconds(600));
        assert!(registry.get("i-1").await.unwrap().is_none());
    }
}
