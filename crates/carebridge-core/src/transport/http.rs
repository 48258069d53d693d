use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use uuid::Uuid;

use super::shared::{ChatError, ChatRequest, ChatResult, USER_AGENT};
use super::{ChatTransport, ChunkStream};
use crate::config::Config;

/// HTTP transport posting to `<api_root>/chat`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    chat_url: String,
}

impl HttpTransport {
    /// Creates a transport for the given API root (e.g. `http://localhost:8080/api`).
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(api_root: &str, connect_timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            chat_url: format!("{}/chat", api_root.trim_end_matches('/')),
        })
    }

    /// Creates a transport from resolved configuration.
    ///
    /// # Errors
    /// Returns an error if the API base URL is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.api_root()?, config.connect_timeout())
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }
}

impl ChatTransport for HttpTransport {
    async fn open(&self, request: ChatRequest) -> ChatResult<ChunkStream> {
        let request_id = Uuid::new_v4().to_string();
        tracing::debug!(
            url = %self.chat_url,
            request_id = %request_id,
            turns = request.messages.len(),
            "Opening chat stream"
        );

        let response = self
            .http
            .post(&self.chat_url)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .header("user-agent", USER_AGENT)
            .header("x-request-id", &request_id)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), request_id = %request_id, "Chat request rejected");
            return Err(ChatError::http_status(status.as_u16(), &body));
        }

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ChatError::network(format!("Stream reading error: {e}"))));
        Ok(chunks.boxed())
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> ChatError {
    if e.is_timeout() {
        ChatError::network(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ChatError::network(format!("Connection failed: {e}"))
    } else {
        ChatError::network(format!("Network error - could not reach the server: {e}"))
    }
}
