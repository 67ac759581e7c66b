//! Hub Client
//!
//! HTTP client for the command proxy, the cloud gateway and the polling
//! endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::Value;
use url::Url;

use crate::config::{CloudGateway, RetryPolicy, SyncConfig};
use crate::error::{Error, Result};
use crate::models::{looks_like_html, CommandRequest, DeviceId, Snapshot};

use super::retry::{bounded, with_retry};
use super::transport::{BeaconSink, CommandTransport, PollSource};

/// Longest diagnostic body kept from an error response.
const MAX_ERROR_BODY: usize = 200;

/// Network client for hub communication
pub struct HubClient {
    client: Client,
    proxy_url: Url,
    polling_url: Url,
    cloud: Option<CloudGateway>,
    retry: RetryPolicy,
}

impl HubClient {
    /// Create a new hub client from configuration
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.retry.request_timeout())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            proxy_url: Url::parse(&config.proxy_url)?,
            polling_url: Url::parse(&config.polling_url)?,
            cloud: config.cloud.clone(),
            retry: config.retry.clone(),
        })
    }

    // ==================== Addressing ====================

    /// URL a command is sent to, chosen per device.
    pub fn command_url(&self, request: &CommandRequest) -> Result<Url> {
        match self.cloud.as_ref().filter(|c| c.routes(&request.device)) {
            Some(cloud) => cloud_url(cloud, request),
            None => {
                let mut url = self.proxy_url.clone();
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("device", request.device.as_str());
                    query.append_pair("command", &request.command);
                    if let Some(value) = &request.value {
                        query.append_pair("value", value);
                    }
                }
                Ok(url)
            }
        }
    }

    fn polling_url_for(&self, ids: &[DeviceId]) -> Url {
        let mut url = self.polling_url.clone();
        let joined = ids.iter().map(DeviceId::as_str).collect::<Vec<_>>().join(",");
        url.query_pairs_mut().append_pair("devices", &joined);
        url
    }

    // ==================== Commands ====================

    async fn send_once(&self, request: &CommandRequest) -> Result<Option<Value>> {
        let url = self.command_url(request)?;
        tracing::debug!(request = %request, "Sending command");

        let response = self.client.get(url).send().await?;
        let body = read_success_body(response).await?;

        if body.trim().is_empty() {
            return Ok(None);
        }
        if looks_like_html(&body) {
            return Err(Error::malformed("command endpoint answered with an HTML page"));
        }
        match serde_json::from_str::<Value>(&body) {
            Ok(reply) => Ok(Some(reply)),
            Err(_) => {
                tracing::debug!(request = %request, "Command accepted with non-JSON reply");
                Ok(None)
            }
        }
    }

    // ==================== Polling ====================

    /// Fetch the state of `ids` in a single attempt.
    pub async fn fetch_once(&self, ids: &[DeviceId]) -> Result<Snapshot> {
        let url = self.polling_url_for(ids);
        self.fetch_url(url).await
    }

    /// Fetch the unfiltered hub payload.
    pub async fn fetch_full(&self) -> Result<Snapshot> {
        let mut url = self.polling_url.clone();
        url.query_pairs_mut().append_pair("full", "1");
        self.fetch_url(url).await
    }

    /// Probe the polling endpoint.
    pub async fn health_check(&self) -> Result<()> {
        let mut url = self.polling_url.clone();
        url.query_pairs_mut().append_pair("health", "1");

        let limit = self.retry.health_check_timeout();
        bounded(limit, "health check", async {
            let response = self.client.get(url).timeout(limit).send().await?;
            read_success_body(response).await.map(|_| ())
        })
        .await
    }

    async fn fetch_url(&self, url: Url) -> Result<Snapshot> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await?;
        let body = read_success_body(response).await?;
        Snapshot::decode(&body)
    }
}

#[async_trait]
impl CommandTransport for HubClient {
    async fn send(&self, request: &CommandRequest) -> Result<Option<Value>> {
        with_retry(&self.retry, "command", |_| self.send_once(request)).await
    }
}

#[async_trait]
impl BeaconSink for HubClient {
    async fn beacon(&self, request: &CommandRequest) -> Result<()> {
        let mut url = self.command_url(request)?;
        let stamp = chrono::Utc::now().timestamp_millis().to_string();
        url.query_pairs_mut().append_pair("_ts", &stamp);

        // The reply is never inspected; reaching the server is all a beacon promises.
        self.client
            .get(url)
            .timeout(Duration::from_millis(self.retry.request_timeout_ms))
            .send()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PollSource for HubClient {
    async fn fetch(&self, ids: &[DeviceId]) -> Result<Snapshot> {
        self.fetch_once(ids).await
    }

    async fn health_check(&self) -> Result<()> {
        HubClient::health_check(self).await
    }
}

fn cloud_url(cloud: &CloudGateway, request: &CommandRequest) -> Result<Url> {
    let mut url = Url::parse(&cloud.devices_base_url)?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::Config("cloud gateway URL cannot carry a path".into()))?;
        segments.pop_if_empty();
        segments.push(request.device.as_str());
        segments.push(&request.command);
        if let Some(value) = &request.value {
            segments.push(value);
        }
    }
    url.query_pairs_mut()
        .append_pair("access_token", &cloud.access_token);
    Ok(url)
}

async fn read_success_body(response: Response) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    Err(Error::Http {
        status: status.as_u16(),
        body: diagnostic(&body),
    })
}

/// Short, single-line excerpt of an error body. Proxies send `{error, details}`.
fn diagnostic(body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        let error = map.get("error").and_then(Value::as_str);
        let details = map.get("details").and_then(Value::as_str);
        match (error, details) {
            (Some(e), Some(d)) => return format!("{}: {}", e, d),
            (Some(e), None) => return e.to_string(),
            _ => {}
        }
    }
    body.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MAX_ERROR_BODY)
        .collect()
}
