use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;

use crate::{Instance, LaunchRequest, Provider, ProviderError, TerminateOutcome};

const TERMINATE_ENDPOINT: &str = "instance-operations/terminate";

/// In-process fleet. Backs the client's `--mock` mode and every test that
/// needs a provider without a network.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    instances: Mutex<BTreeMap<String, Instance>>,
    launches: AtomicU64,
    terminations: AtomicU64,
    terminate_calls: AtomicU64,
    fail_next: AtomicU32,
    fail_terminate: AtomicU32,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instances(instances: impl IntoIterator<Item = Instance>) -> Self {
        let provider = Self::new();
        for instance in instances {
            provider.insert(instance);
        }
        provider
    }

    pub fn insert(&self, instance: Instance) {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.id.clone(), instance);
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.instances.lock().unwrap().contains_key(instance_id)
    }

    /// Number of terminate calls that actually destroyed an instance.
    pub fn terminations(&self) -> u64 {
        self.terminations.load(Ordering::SeqCst)
    }

    /// Number of terminate calls received, including failed and no-op ones.
    pub fn terminate_calls(&self) -> u64 {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` calls fail with a 503.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make only the next `n` terminate calls fail with a 503.
    pub fn fail_next_terminate(&self, n: u32) {
        self.fail_terminate.store(n, Ordering::SeqCst);
    }

    fn injected_failure(&self, endpoint: &str) -> Result<(), ProviderError> {
        let take = |counter: &AtomicU32| {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        };
        let failed = take(&self.fail_next)
            || (endpoint == TERMINATE_ENDPOINT && take(&self.fail_terminate));
        if failed {
            Err(ProviderError::Api {
                status: 503,
                endpoint: endpoint.to_string(),
                message: "injected failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        self.injected_failure("instances")?;
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }

    async fn launch_instance(&self, request: &LaunchRequest) -> Result<String, ProviderError> {
        self.injected_failure("instance-operations/launch")?;
        let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("mock-{n:04}");
        self.insert(Instance {
            id: id.clone(),
            name: request.name.clone(),
            ip: None,
            status: "booting".to_string(),
            instance_type: request.instance_type_name.clone(),
            region: request.region_name.clone(),
            file_system_names: request.file_system_names.clone(),
            created_at: Some(Utc::now()),
        });
        info!("Mock launched instance {}", id);
        Ok(id)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<TerminateOutcome, ProviderError> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        self.injected_failure(TERMINATE_ENDPOINT)?;
        match self.instances.lock().unwrap().remove(instance_id) {
            Some(_) => {
                self.terminations.fetch_add(1, Ordering::SeqCst);
                Ok(TerminateOutcome::Terminated)
            }
            None => Ok(TerminateOutcome::AlreadyGone),
        }
    }
}
