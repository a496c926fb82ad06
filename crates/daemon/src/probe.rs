use common::{Clock, SharedClock};
use reqwest::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::keeper::LeaseKeeper;
use crate::terminate::until_done;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Passive activity source: watches a request counter exposed by the
/// monitored service in Prometheus text format. Any increase counts as
/// activity, exactly like an explicit `POST /activity`.
pub struct ActivityProbe {
    http: Client,
    url: String,
    metric: String,
    service: String,
    last_total: Mutex<Option<f64>>,
    healthy: AtomicBool,
}

impl ActivityProbe {
    pub fn new(url: impl Into<String>, metric: impl Into<String>, service: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            url: url.into(),
            metric: metric.into(),
            service: service.into(),
            last_total: Mutex::new(None),
            healthy: AtomicBool::new(false),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Record a new counter reading. Returns `true` if it moved forward.
    /// The first reading only sets the baseline; a counter reset re-baselines.
    pub fn observe(&self, total: f64) -> bool {
        let mut last = self.last_total.lock().unwrap();
        let moved = matches!(*last, Some(prev) if total > prev);
        *last = Some(total);
        moved
    }

    /// Fetch the metrics endpoint once.
    pub async fn poll(&self) -> bool {
        let body = match self.fetch().await {
            Ok(body) => body,
            Err(e) => {
                self.healthy.store(false, Ordering::Relaxed);
                debug!("Activity probe {} unreachable: {}", self.url, e);
                return false;
            }
        };
        self.healthy.store(true, Ordering::Relaxed);
        match sum_metric(&body, &self.metric) {
            Some(total) => self.observe(total),
            None => {
                debug!("Metric {} not present at {}", self.metric, self.url);
                false
            }
        }
    }

    async fn fetch(&self) -> Result<String, reqwest::Error> {
        self.http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }

    pub fn start(
        self: Arc<Self>,
        keeper: Arc<LeaseKeeper>,
        clock: SharedClock,
        interval: Duration,
        mut done: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Activity probe started on {} (metric={}, interval={}s)",
                self.url,
                self.metric,
                interval.as_secs()
            );
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.poll().await {
                            match keeper.record_activity(clock.now()) {
                                Ok(at) => debug!("Observed traffic on {}; idle clock reset at {}", self.service, at),
                                Err(e) => warn!("Ignoring observed activity: {}", e),
                            }
                        }
                    }
                    _ = until_done(&mut done) => break,
                }
            }
        })
    }
}

/// Sum every sample of `metric` in a Prometheus text exposition.
pub fn sum_metric(body: &str, metric: &str) -> Option<f64> {
    let mut total = None;
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let name_end = line.find(|c: char| c == '{' || c.is_whitespace()).unwrap_or(line.len());
        if &line[..name_end] != metric {
            continue;
        }
        let rest = match line[name_end..].rfind('}') {
            Some(close) if line[name_end..].starts_with('{') => &line[name_end + close + 1..],
            _ => &line[name_end..],
        };
        if let Some(value) = rest.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()) {
            *total.get_or_insert(0.0) += value;
        }
    }
    total
}
