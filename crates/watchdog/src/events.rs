use chrono::{DateTime, Duration, Utc};
use common::event::EVENT_KEY_PREFIX;
use common::{defaults, Clock, EventTotals, EventsQuery, EventsResponse, SharedClock, TerminationEvent};
use std::sync::Arc;
use tracing::{info, warn};

use crate::store::{KvStore, StoreError};

/// Append-only audit trail of termination decisions.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn KvStore>,
    clock: SharedClock,
    ttl: Duration,
}

impl EventLog {
    pub fn new(store: Arc<dyn KvStore>, clock: SharedClock, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub async fn append(&self, event: &TerminationEvent) -> Result<String, StoreError> {
        let key = event.key();
        let value = serde_json::to_string(event).map_err(|source| StoreError::Corrupt {
            key: key.clone(),
            source,
        })?;
        self.store.put(&key, value, Some(self.ttl)).await?;
        info!(
            "Recorded termination of {} ({}, uptime {}m)",
            event.instance_id, event.reason, event.uptime_minutes
        );
        Ok(key)
    }

    /// Filtered events, newest first. Totals cover every match, not just the
    /// page returned.
    pub async fn query(&self, query: &EventsQuery) -> Result<EventsResponse, StoreError> {
        let hours = query.hours.unwrap_or(defaults::EVENTS_DEFAULT_HOURS);
        let limit = query
            .limit
            .unwrap_or(defaults::EVENTS_DEFAULT_LIMIT)
            .min(defaults::EVENTS_MAX_LIMIT);
        let cutoff = Duration::try_hours(hours)
            .and_then(|window| self.clock.now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut events = Vec::new();
        for (key, raw) in self.store.list_prefix(EVENT_KEY_PREFIX).await? {
            let event: TerminationEvent = match serde_json::from_str(&raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping unreadable event under {}: {}", key, e);
                    continue;
                }
            };
            if event.timestamp < cutoff {
                continue;
            }
            if query.instance_id.as_deref().is_some_and(|id| id != event.instance_id) {
                continue;
            }
            if query.event_type.as_deref().is_some_and(|t| t != event.reason.as_str()) {
                continue;
            }
            events.push(event);
        }

        let mut totals = EventTotals::default();
        for event in &events {
            totals.events += 1;
            *totals.by_reason.entry(event.reason.to_string()).or_default() += 1;
            totals.uptime_minutes = totals.uptime_minutes.saturating_add(event.uptime_minutes);
        }

        // keys sort oldest first
        events.reverse();
        events.truncate(limit);
        Ok(EventsResponse {
            count: events.len(),
            events,
            totals,
        })
    }
}
