//! Compute provider access: list, launch and terminate GPU instances.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod lambda;
pub mod memory;

pub use catalog::{Catalog, LaunchCheck};
pub use lambda::LambdaClient;
pub use memory::MemoryProvider;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: Option<String>,
    pub ip: Option<String>,
    pub status: String,
    pub instance_type: String,
    pub region: String,
    #[serde(default)]
    pub file_system_names: Vec<String>,
    /// Not populated by every provider while the instance is booting.
    pub created_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    /// Terminated or on its way out. Nothing left to enforce.
    pub fn is_gone(&self) -> bool {
        matches!(self.status.as_str(), "terminated" | "terminating")
    }

    pub fn carries_marker(&self, marker: &str) -> bool {
        self.file_system_names.iter().any(|fs| fs == marker)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub region_name: String,
    pub instance_type_name: String,
    pub ssh_key_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_system_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Terminated,
    /// The provider no longer knows the instance, or it is already on its way out.
    AlreadyGone,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("provider returned {status} for {endpoint}: {message}")]
    Api {
        status: u16,
        endpoint: String,
        message: String,
    },
    #[error("malformed provider response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Worth another attempt: network trouble, rate limiting or a 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport { .. } => true,
            ProviderError::Api { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Decode { .. } => false,
            ProviderError::Exhausted { last, .. } => last.is_transient(),
        }
    }

    /// The provider says the instance does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ProviderError::Api { status, message, .. } => {
                let message = message.to_ascii_lowercase();
                *status == 404
                    || message.contains("not found")
                    || message.contains("does not exist")
                    || message.contains("object-does-not-exist")
            }
            ProviderError::Exhausted { last, .. } => last.is_not_found(),
            _ => false,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError>;

    /// Returns the id of the new instance.
    async fn launch_instance(&self, request: &LaunchRequest) -> Result<String, ProviderError>;

    /// Idempotent: terminating an instance that is already gone succeeds.
    async fn terminate_instance(&self, instance_id: &str) -> Result<TerminateOutcome, ProviderError>;

    /// Instance types, SSH keys and filesystems on offer, for checking a
    /// launch up front. `None` when the provider has nothing to describe.
    async fn catalog(&self) -> Option<Catalog> {
        None
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<Instance>, ProviderError> {
        Ok(self
            .list_instances()
            .await?
            .into_iter()
            .find(|i| i.id == instance_id))
    }
}
