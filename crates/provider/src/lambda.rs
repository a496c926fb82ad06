use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::RetryPolicy;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, FileSystem, InstanceType};
use crate::{Instance, LaunchRequest, Provider, ProviderError, TerminateOutcome};

pub const DEFAULT_BASE_URL: &str = "https://cloud.lambda.ai/api/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client for a Lambda-style GPU cloud.
#[derive(Clone)]
pub struct LambdaClient {
    http: Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawInstance {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ip: Option<String>,
    status: String,
    instance_type: Named,
    region: Named,
    #[serde(default)]
    file_system_names: Vec<String>,
    #[serde(default)]
    created_at: Option<String>,
}

impl From<RawInstance> for Instance {
    fn from(raw: RawInstance) -> Self {
        Instance {
            id: raw.id,
            name: raw.name,
            ip: raw.ip,
            status: raw.status,
            instance_type: raw.instance_type.name,
            region: raw.region.name,
            file_system_names: raw.file_system_names,
            created_at: raw
                .created_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LaunchData {
    #[serde(default)]
    instance_ids: Vec<String>,
}

impl LambdaClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send_once(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value, ProviderError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut req = self.http.request(method, &url).bearer_auth(&self.api_key);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(|source| ProviderError::Transport {
            endpoint: endpoint.to_string(),
            source,
        })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|source| ProviderError::Transport {
            endpoint: endpoint.to_string(),
            source,
        })?;

        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                endpoint: endpoint.to_string(),
                message: error_message(status, &text),
            });
        }

        serde_json::from_str(&text).map_err(|e| ProviderError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<Value, ProviderError> {
        let operation = format!("{} {}", method, endpoint);
        let result = self
            .retry
            .run(
                &operation,
                || self.send_once(method.clone(), endpoint, body.as_ref()),
                ProviderError::is_transient,
            )
            .await;
        result.map_err(|(last, attempts)| {
            if attempts > 1 {
                ProviderError::Exhausted {
                    operation,
                    attempts,
                    last: Box::new(last),
                }
            } else {
                last
            }
        })
    }

    async fn get_data<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ProviderError> {
        let value = self.request(Method::GET, endpoint, None).await?;
        decode_data(endpoint, value)
    }

    pub async fn list_instance_types(&self) -> Result<Vec<InstanceType>, ProviderError> {
        let data: serde_json::Map<String, Value> = self.get_data("instance-types").await?;
        Ok(data
            .into_iter()
            .map(|(name, info)| {
                let it = &info["instance_type"];
                InstanceType {
                    description: it["description"].as_str().unwrap_or(&name).to_string(),
                    price_cents_per_hour: it["price_cents_per_hour"].as_u64().unwrap_or(0),
                    regions_available: info["regions_with_capacity_available"]
                        .as_array()
                        .map(|rs| {
                            rs.iter()
                                .filter_map(|r| r["name"].as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default(),
                    name,
                }
            })
            .collect())
    }

    pub async fn list_ssh_keys(&self) -> Result<Vec<String>, ProviderError> {
        let keys: Vec<Named> = self.get_data("ssh-keys").await?;
        Ok(keys.into_iter().map(|k| k.name).collect())
    }

    pub async fn list_file_systems(&self) -> Result<Vec<FileSystem>, ProviderError> {
        #[derive(Deserialize)]
        struct RawFs {
            id: String,
            name: String,
            region: Named,
            mount_point: String,
            #[serde(default)]
            is_in_use: bool,
        }
        let raw: Vec<RawFs> = self.get_data("file-systems").await?;
        Ok(raw
            .into_iter()
            .map(|fs| FileSystem {
                id: fs.id,
                name: fs.name,
                region: fs.region.name,
                mount_point: fs.mount_point,
                is_in_use: fs.is_in_use,
            })
            .collect())
    }
}

fn decode_data<T: DeserializeOwned>(endpoint: &str, value: Value) -> Result<T, ProviderError> {
    serde_json::from_value::<Envelope<T>>(value)
        .map(|e| e.data)
        .map_err(|e| ProviderError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })
}

/// Pull the human-readable message out of `{"error": {"code", "message"}}`.
fn error_message(status: StatusCode, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().map(|v| &v["error"]);
    match error {
        Some(err) if err.is_object() => {
            let code = err["code"].as_str().unwrap_or_default();
            let message = err["message"].as_str().unwrap_or_default();
            match (code.is_empty(), message.is_empty()) {
                (false, false) => format!("{code}: {message}"),
                (false, true) => code.to_string(),
                _ => message.to_string(),
            }
        }
        _ if !body.trim().is_empty() => body.trim().to_string(),
        _ => status.canonical_reason().unwrap_or("unknown error").to_string(),
    }
}

/// Keep what could be fetched; a missing part only weakens the launch check.
fn catalog_part<T>(what: &str, result: Result<T, ProviderError>) -> Option<T> {
    match result {
        Ok(part) => Some(part),
        Err(e) => {
            warn!("Could not fetch {}: {}", what, e);
            None
        }
    }
}

#[async_trait]
impl Provider for LambdaClient {
    async fn catalog(&self) -> Option<Catalog> {
        let (instance_types, ssh_keys, file_systems) = tokio::join!(
            self.list_instance_types(),
            self.list_ssh_keys(),
            self.list_file_systems()
        );
        Some(Catalog {
            instance_types: catalog_part("instance types", instance_types),
            ssh_keys: catalog_part("SSH keys", ssh_keys),
            file_systems: catalog_part("filesystems", file_systems),
        })
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let raw: Vec<RawInstance> = self.get_data("instances").await?;
        debug!("Provider reports {} instance(s)", raw.len());
        Ok(raw.into_iter().map(Instance::from).collect())
    }

    async fn launch_instance(&self, request: &LaunchRequest) -> Result<String, ProviderError> {
        let endpoint = "instance-operations/launch";
        let body = serde_json::to_value(request).map_err(|e| ProviderError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;
        let value = self.request(Method::POST, endpoint, Some(body)).await?;
        let data: LaunchData = decode_data(endpoint, value)?;
        let id = data
            .instance_ids
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Decode {
                endpoint: endpoint.to_string(),
                message: "no instance id returned from launch".to_string(),
            })?;
        info!("Launched instance {}", id);
        Ok(id)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<TerminateOutcome, ProviderError> {
        let body = serde_json::json!({ "instance_ids": [instance_id] });
        match self
            .request(Method::POST, "instance-operations/terminate", Some(body))
            .await
        {
            Ok(_) => {
                info!("Terminate accepted for instance {}", instance_id);
                Ok(TerminateOutcome::Terminated)
            }
            Err(e) if e.is_not_found() => {
                info!("Instance {} already gone: {}", instance_id, e);
                Ok(TerminateOutcome::AlreadyGone)
            }
            Err(e) => Err(e),
        }
    }
}
