//! HTTP Event Collector sink
//!
//! Delivers batches as a single POST whose body is the newline-concatenation
//! of one JSON event per line, authenticated with a bearer token. Delivery
//! succeeds only on an exact 200 response; anything else drops the batch.
//! The same transport backs the synchronous probes used by source
//! validation and the health reporter.

use crate::sink::{Event, Sink};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

/// Timeout for batch delivery
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for validation and health-check probes
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build an HTTP client with the given request timeout.
pub fn client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")
}

/// POST a single JSON body with HEC headers. Success iff the response
/// status is exactly 200; any other status carries the response body in
/// the error.
pub async fn post(client: &Client, url: &str, token: &str, body: String) -> Result<()> {
    let response = client
        .post(url)
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(body)
        .send()
        .await
        .context("Failed to send HEC request")?;

    let status = response.status();
    if status.as_u16() != 200 {
        let body = response.text().await.unwrap_or_default();
        bail!("HTTP {status}: {body}");
    }
    Ok(())
}

/// Validation probe for a source's HEC target.
pub async fn probe_source(url: &str, token: &str, source_name: &str) -> Result<()> {
    let event = json!({
        "time": Utc::now().timestamp(),
        "event": { "message": "Source Check - OK" },
        "source": source_name,
    });
    let client = client(PROBE_TIMEOUT)?;
    post(&client, url, token, event.to_string()).await
}

/// Configuration probe for the health reporter's endpoint.
pub async fn probe_health(url: &str, token: &str) -> Result<()> {
    let event = json!({
        "time": Utc::now().timestamp(),
        "event": { "message": "Health Check Connector - OK" },
        "source": "Heartbeat",
    });
    let client = client(PROBE_TIMEOUT)?;
    post(&client, url, token, event.to_string()).await
}

/// HEC delivery target for a source's batches
pub struct HecSink {
    source_name: String,
    url: String,
    token: String,
    client: Client,
}

impl HecSink {
    pub fn new(source_name: &str, url: &str, token: &str) -> Result<Self> {
        Ok(Self {
            source_name: source_name.to_string(),
            url: url.to_string(),
            token: token.to_string(),
            client: client(DELIVERY_TIMEOUT)?,
        })
    }

    fn body(events: &[Event]) -> Result<String> {
        let lines: Result<Vec<String>, _> = events.iter().map(serde_json::to_string).collect();
        Ok(lines.context("Failed to serialize events")?.join("\n"))
    }
}

#[async_trait::async_trait]
impl Sink for HecSink {
    async fn deliver(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let body = Self::body(events)?;
        post(&self.client, &self.url, &self.token, body)
            .await
            .map_err(|e| anyhow!("HEC delivery failed for source {}: {e:#}", self.source_name))?;

        info!(
            "Delivered {} events to HEC for source {}",
            events.len(),
            self.source_name
        );
        Ok(())
    }
}
