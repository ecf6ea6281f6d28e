//! HTTP client for the generation service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use postgen_core::config::ClientConfig;
use postgen_core::error::{PostgenError, Result, TransportError};
use postgen_core::event::Source;

use crate::source::{ChunkSource, ResponseSource};

pub const STREAM_PATH: &str = "generate-post-stream";
pub const GENERATE_PATH: &str = "generate-post";
pub const HEALTH_PATH: &str = "health";

const EVENT_STREAM: &str = "text/event-stream";

/// Opens the streaming response for a topic.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue the request and return the body once headers arrived with a
    /// success status.
    async fn open(&self, topic: &str) -> Result<Box<dyn ChunkSource>>;
}

/// Result of the non-streaming endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedPost {
    pub topic: String,
    pub linkedin_post: String,
    #[serde(default)]
    pub news_sources: Vec<Source>,
    #[serde(default)]
    pub image_suggestion: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    topic: &'a str,
}

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
}

#[derive(Deserialize)]
struct ErrorDetail {
    detail: String,
}

pub struct GenerationClient {
    client: Client,
    config: ClientConfig,
}

impl GenerationClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| PostgenError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// `GET` URL of the event stream, topic percent-encoded.
    pub fn stream_url(&self, topic: &str) -> String {
        format!(
            "{}?topic={}",
            self.config.endpoint(STREAM_PATH),
            urlencoding::encode(topic)
        )
    }

    /// True when the service answers `{"status": "ok"}`.
    pub async fn health(&self) -> Result<bool> {
        let url = self.config.endpoint(HEALTH_PATH);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        if !resp.status().is_success() {
            warn!(status = resp.status().as_u16(), "Health check failed");
            return Ok(false);
        }

        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::Read(e.to_string()))?;
        Ok(serde_json::from_str::<HealthResponse>(&body)
            .map(|h| h.status == "ok")
            .unwrap_or(false))
    }

    /// Generate a post in one request, without progress events.
    pub async fn generate_post(&self, topic: &str) -> Result<GeneratedPost> {
        if topic.trim().is_empty() {
            return Err(PostgenError::EmptyTopic);
        }

        let url = self.config.endpoint(GENERATE_PATH);
        info!(%url, "Requesting post");
        let resp = self
            .client
            .post(&url)
            .json(&GenerateRequest { topic })
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let resp = ensure_success(resp).await?;

        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::Read(e.to_string()))?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl Transport for GenerationClient {
    async fn open(&self, topic: &str) -> Result<Box<dyn ChunkSource>> {
        let url = self.stream_url(topic);
        info!(%url, "Opening generation stream");

        let resp = self
            .client
            .get(&url)
            .header(ACCEPT, EVENT_STREAM)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let resp = ensure_success(resp).await?;

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with(EVENT_STREAM) {
            debug!(content_type, "Stream response is not text/event-stream");
        }

        Ok(Box::new(ResponseSource::new(resp)))
    }
}

/// Map a non-success status to [`TransportError::Status`], preferring the
/// service's `detail` message over the raw body.
async fn ensure_success(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorDetail>(&body)
        .map(|e| e.detail)
        .unwrap_or(body);
    warn!(status = status.as_u16(), "Generation service returned an error");

    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    }
    .into())
}
