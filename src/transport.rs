//! HTTP transport to the local agent.
//!
//! The tracer talks to the agent through the [`HttpClient`] trait so users
//! can bring their own client; a `reqwest`-backed blocking implementation
//! ships behind the `reqwest-blocking-client` feature. Requests run on the
//! writer's sender threads, never on application threads.

use crate::config::Config;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Per-request timeout applied by the default client.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request could not be constructed.
    #[error(transparent)]
    Request(#[from] http::Error),
    /// The agent answered with a non-success status.
    #[error("agent responded with status {0}")]
    Status(u16),
    /// The HTTP client failed to carry the request.
    #[error("http client error: {0}")]
    Client(String),
}

impl TransportError {
    /// A 404 or 415 means the agent does not speak this endpoint version
    /// and the writer should downgrade.
    pub(crate) fn is_downgrade(&self) -> bool {
        matches!(self, TransportError::Status(404) | TransportError::Status(415))
    }
}

/// A blocking HTTP client carrying requests to the agent.
pub trait HttpClient: Send + Sync + fmt::Debug {
    fn send(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>, TransportError>;
}

/// Default [`HttpClient`] backed by `reqwest::blocking`.
#[cfg(feature = "reqwest-blocking-client")]
#[derive(Debug)]
pub struct ReqwestBlockingClient {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "reqwest-blocking-client")]
impl ReqwestBlockingClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        ReqwestBlockingClient { client }
    }
}

#[cfg(feature = "reqwest-blocking-client")]
impl Default for ReqwestBlockingClient {
    fn default() -> Self {
        ReqwestBlockingClient::new(DEFAULT_TIMEOUT)
    }
}

#[cfg(feature = "reqwest-blocking-client")]
impl HttpClient for ReqwestBlockingClient {
    fn send(
        &self,
        request: http::Request<Vec<u8>>,
    ) -> Result<http::Response<Vec<u8>>, TransportError> {
        let request = reqwest::blocking::Request::try_from(request)
            .map_err(|e| TransportError::Client(e.to_string()))?;
        let response = self
            .client
            .execute(request)
            .map_err(|e| TransportError::Client(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        http::Response::builder()
            .status(status)
            .body(body.to_vec())
            .map_err(TransportError::from)
    }
}

/// The agent's `/info` self-description, used for feature discovery.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct AgentInfo {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub feature_flags: Vec<String>,
    #[serde(default)]
    pub client_drop_p0s: bool,
}

impl AgentInfo {
    pub(crate) fn supports_long_running(&self) -> bool {
        self.feature_flags.iter().any(|f| f == "long_running_spans")
    }
}

/// Prepared connection to one agent: base URL plus the identity headers
/// sent with every request.
pub(crate) struct Transport {
    client: Arc<dyn HttpClient>,
    base_url: String,
    headers: Vec<(&'static str, String)>,
}

impl Transport {
    pub(crate) fn new(config: &Config, client: Arc<dyn HttpClient>) -> Self {
        let mut headers = vec![
            ("Datadog-Meta-Lang", "rust".to_string()),
            ("Datadog-Meta-Tracer-Version", config.tracer_version.clone()),
        ];
        if !config.language_version.is_empty() {
            headers.push(("Datadog-Meta-Lang-Version", config.language_version.clone()));
        }
        if !config.container_id.is_empty() {
            headers.push(("Datadog-Container-ID", config.container_id.clone()));
        }
        Transport {
            client,
            base_url: config.agent_url.trim_end_matches('/').to_string(),
            headers,
        }
    }

    /// POSTs one payload to a traces endpoint. On success returns the
    /// response body, a rates JSON consumed by the priority sampler.
    pub(crate) fn send_traces(
        &self,
        path: &str,
        content_type: &str,
        body: Vec<u8>,
        trace_count: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut builder = http::Request::builder()
            .method(http::Method::POST)
            .uri(format!("{}{}", self.base_url, path))
            .header(http::header::CONTENT_TYPE, content_type)
            .header("X-Datadog-Trace-Count", trace_count.to_string());
        for (name, value) in &self.headers {
            builder = builder.header(*name, value);
        }
        let response = self.client.send(builder.body(body)?)?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(response.into_body())
    }

    /// Fetches the agent's feature self-description.
    pub(crate) fn agent_info(&self) -> Result<AgentInfo, TransportError> {
        let mut builder = http::Request::builder()
            .method(http::Method::GET)
            .uri(format!("{}/info", self.base_url));
        for (name, value) in &self.headers {
            builder = builder.header(*name, value);
        }
        let response = self.client.send(builder.body(Vec::new())?)?;
        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        serde_json::from_slice(response.body())
            .map_err(|e| TransportError::Client(format!("malformed /info body: {e}")))
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
