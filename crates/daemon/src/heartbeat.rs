use common::{Clock, HeartbeatPayload, SharedClock, TerminationEvent};
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::keeper::LeaseKeeper;
use crate::probe::ActivityProbe;
use crate::terminate::until_done;

const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("watchdog unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("watchdog rejected push with {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Outbound channel to the external watchdog.
#[derive(Clone)]
pub struct WatchdogClient {
    http: Client,
    base_url: String,
    token: String,
}

impl WatchdogClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn post<T: serde::Serialize>(&self, path: &str, body: &T) -> Result<(), PushError> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(PushError::Rejected { status, body })
        }
    }

    pub async fn send_heartbeat(&self, payload: &HeartbeatPayload) -> Result<(), PushError> {
        self.post("/heartbeat", payload).await
    }

    pub async fn report_event(&self, event: &TerminationEvent) -> Result<(), PushError> {
        self.post("/events", event).await
    }
}

/// Periodically tells the watchdog this instance is alive.
///
/// Delivery failures are logged and otherwise ignored: local lease
/// decisions never depend on the watchdog being reachable.
pub struct HeartbeatEmitter {
    client: WatchdogClient,
    keeper: Arc<LeaseKeeper>,
    clock: SharedClock,
    probe: Option<Arc<ActivityProbe>>,
    model_loaded: Option<String>,
}

impl HeartbeatEmitter {
    pub fn new(client: WatchdogClient, keeper: Arc<LeaseKeeper>, clock: SharedClock) -> Self {
        Self {
            client,
            keeper,
            clock,
            probe: None,
            model_loaded: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<ActivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model_loaded = model;
        self
    }

    pub fn client(&self) -> &WatchdogClient {
        &self.client
    }

    pub fn payload(&self) -> HeartbeatPayload {
        let now = self.clock.now();
        let lease = self.keeper.lease();
        let mut services = BTreeMap::new();
        if let Some(probe) = &self.probe {
            services.insert(probe.service_name().to_string(), probe.is_healthy());
        }
        HeartbeatPayload {
            instance_id: lease.instance_id.clone(),
            timestamp: now,
            uptime_minutes: lease.uptime_minutes(now),
            model_loaded: self.model_loaded.clone(),
            services,
            termination_reason: lease.termination_reason,
        }
    }

    /// Push one heartbeat. Returns whether the watchdog accepted it.
    pub async fn beat(&self) -> bool {
        let payload = self.payload();
        match self.client.send_heartbeat(&payload).await {
            Ok(()) => {
                debug!("Heartbeat sent for {}", payload.instance_id);
                true
            }
            Err(e) => {
                warn!("Heartbeat failed: {}", e);
                false
            }
        }
    }

    pub fn start(
        self: Arc<Self>,
        interval: Duration,
        mut done: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Heartbeat emitter started (interval={}s)", interval.as_secs());
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.beat().await;
                    }
                    _ = until_done(&mut done) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::Utc;
    use common::{LeaseConfig, ManualClock, TerminationReason};

    fn emitter(url: &str) -> HeartbeatEmitter {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let keeper = Arc::new(
            LeaseKeeper::open(db::init_in_memory().unwrap(), "i-1", &LeaseConfig::default(), clock.now())
                .unwrap(),
        );
        HeartbeatEmitter::new(WatchdogClient::new(url, "t"), keeper, clock)
    }

    #[test]
    fn payload_carries_service_health_and_reason() {
        let probe = Arc::new(ActivityProbe::new("http://127.0.0.1:1/metrics", "m", "sglang"));
        let emitter = emitter("http://127.0.0.1:1").with_probe(probe);
        emitter.keeper.begin_shutdown(TerminationReason::IdleTimeout);

        let payload = emitter.payload();
        assert_eq!(payload.instance_id, "i-1");
        assert_eq!(payload.services.get("sglang"), Some(&false));
        assert_eq!(payload.termination_reason, Some(TerminationReason::IdleTimeout));
    }

    #[tokio::test]
    async fn loop_ends_once_terminated() {
        let (done_tx, done) = watch::channel(false);
        let handle = Arc::new(emitter("http://127.0.0.1:1")).start(Duration::from_secs(3600), done);

        done_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("emitter did not stop")
            .unwrap();
    }
}
