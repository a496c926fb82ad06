use anyhow::Context;
use common::TerminationEvent;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::remote::WatchdogApi;

/// Default queue location (~/.config/gpulease/pending.json on Linux).
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gpulease")
        .join("pending.json")
}

/// Termination events that could not be delivered to the watchdog yet.
pub struct PendingQueue {
    path: PathBuf,
}

impl PendingQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable file is an empty queue.
    pub fn load(&self) -> Vec<TerminationEvent> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&raw) {
            Ok(events) => events,
            Err(e) => {
                warn!("Ignoring unreadable pending queue {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    pub fn push(&self, event: TerminationEvent) -> anyhow::Result<()> {
        let mut events = self.load();
        events.push(event);
        self.save(&events)
    }

    fn save(&self, events: &[TerminationEvent]) -> anyhow::Result<()> {
        if events.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)
                    .with_context(|| format!("failed to remove {}", self.path.display()))?;
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(events)?;
        fs::write(&self.path, body).with_context(|| format!("failed to write {}", self.path.display()))
    }

    /// Deliver everything queued. Events that fail stay queued.
    /// Returns (delivered, still pending).
    pub async fn sync(&self, watchdog: &WatchdogApi) -> anyhow::Result<(usize, usize)> {
        let events = self.load();
        let mut remaining = Vec::new();
        let mut delivered = 0;
        for event in events {
            match watchdog.record_event(&event).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    warn!("Could not deliver event for {}: {}", event.instance_id, e);
                    remaining.push(event);
                }
            }
        }
        self.save(&remaining)?;
        Ok((delivered, remaining.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{RetryPolicy, TerminationReason};
    use tempfile::TempDir;

    fn event(id: &str) -> TerminationEvent {
        TerminationEvent {
            timestamp: chrono::Utc::now(),
            instance_id: id.into(),
            reason: TerminationReason::Manual,
            uptime_minutes: 42,
            gpu_type: "gpu_1x_a10".into(),
            region: "us-east-1".into(),
        }
    }

    #[test]
    fn push_and_load() {
        let dir = TempDir::new().unwrap();
        let queue = PendingQueue::new(dir.path().join("sub").join("pending.json"));
        assert!(queue.load().is_empty());

        queue.push(event("i-1")).unwrap();
        queue.push(event("i-2")).unwrap();
        let loaded = queue.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].instance_id, "i-2");
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pending.json");
        fs::write(&path, "not json").unwrap();
        assert!(PendingQueue::new(path).load().is_empty());
    }

    #[tokio::test]
    async fn failed_sync_keeps_events() {
        let dir = TempDir::new().unwrap();
        let queue = PendingQueue::new(dir.path().join("pending.json"));
        queue.push(event("i-1")).unwrap();

        let watchdog = WatchdogApi::new("http://127.0.0.1:1", "t").with_retry(RetryPolicy::immediate(1));
        let (delivered, pending) = queue.sync(&watchdog).await.unwrap();
        assert_eq!((delivered, pending), (0, 1));
        assert_eq!(queue.load().len(), 1);
    }

    #[tokio::test]
    async fn empty_sync_removes_nothing() {
        let dir = TempDir::new().unwrap();
        let queue = PendingQueue::new(dir.path().join("pending.json"));
        let watchdog = WatchdogApi::new("http://127.0.0.1:1", "t");
        assert_eq!(queue.sync(&watchdog).await.unwrap(), (0, 0));
        assert!(!queue.path().exists());
    }
}
