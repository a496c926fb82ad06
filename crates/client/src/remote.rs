use common::{
    ErrorResponse, EventsQuery, EventsResponse, ExtendRequest, ExtendResponse, LeaseSnapshot, RetryPolicy,
    ShutdownResponse, StoreAck, TerminationEvent,
};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("{service} unreachable: {source}")]
    Unreachable {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    /// The server answered with an error. `message` is its `error` field, verbatim.
    #[error("{service} returned {status}: {message}")]
    Rejected {
        service: &'static str,
        status: u16,
        message: String,
    },
    #[error("unexpected response from {service}: {source}")]
    Decode {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

impl RemoteError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RemoteError::Unreachable { .. })
    }
}

/// Authenticated JSON calls against one of our own services.
#[derive(Clone)]
struct Endpoint {
    service: &'static str,
    http: Client,
    base_url: String,
    token: String,
    retry: RetryPolicy,
}

impl Endpoint {
    fn new(service: &'static str, base_url: &str, token: &str) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            service,
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn send_once<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, RemoteError> {
        let service = self.service;
        let resp = builder
            .send()
            .await
            .map_err(|source| RemoteError::Unreachable { service, source })?;
        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .await
                .map_err(|source| RemoteError::Decode { service, source });
        }
        let text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.error)
            .unwrap_or(text);
        Err(RemoteError::Rejected {
            service,
            status: status.as_u16(),
            message,
        })
    }

    /// Only transport failures are retried. A rejection is an answer.
    async fn call<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, RemoteError> {
        let what = format!("{} {}", method, path);
        self.retry
            .run(
                &what,
                || {
                    let mut builder = self.request(method.clone(), path);
                    if let Some(body) = body {
                        builder = builder.json(body);
                    }
                    self.send_once(builder)
                },
                RemoteError::is_unreachable,
            )
            .await
            .map_err(|(e, _)| e)
    }
}

/// Client for one instance daemon's control API.
pub struct DaemonApi {
    endpoint: Endpoint,
}

impl DaemonApi {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            endpoint: Endpoint::new("daemon", base_url, token),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.endpoint.retry = retry;
        self
    }

    /// Single unauthenticated probe, no retries.
    pub async fn is_up(&self) -> bool {
        let url = format!("{}/health", self.endpoint.base_url);
        matches!(self.endpoint.http.get(url).send().await, Ok(r) if r.status().is_success())
    }

    pub async fn status(&self) -> Result<LeaseSnapshot, RemoteError> {
        self.endpoint.call(Method::GET, "/status", None::<&()>).await
    }

    pub async fn extend(&self, hours: i64) -> Result<ExtendResponse, RemoteError> {
        self.endpoint
            .call(Method::POST, "/extend", Some(&ExtendRequest { hours }))
            .await
    }

    pub async fn shutdown(&self) -> Result<ShutdownResponse, RemoteError> {
        self.endpoint.call(Method::POST, "/shutdown", None::<&()>).await
    }
}

/// Client for the external watchdog.
pub struct WatchdogApi {
    endpoint: Endpoint,
}

impl WatchdogApi {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            endpoint: Endpoint::new("watchdog", base_url, token),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.endpoint.retry = retry;
        self
    }

    pub async fn record_event(&self, event: &TerminationEvent) -> Result<StoreAck, RemoteError> {
        self.endpoint.call(Method::POST, "/events", Some(event)).await
    }

    pub async fn events(&self, query: &EventsQuery) -> Result<EventsResponse, RemoteError> {
        let builder = self.endpoint.request(Method::GET, "/events").query(query);
        self.endpoint.send_once(builder).await
    }
}
