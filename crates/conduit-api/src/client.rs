//! HTTP client for LLM endpoints that answer with a JSON body or an SSE stream.

use std::time::Duration;

use conduit_types::ApiError;
use conduit_types::provider::ChunkCallback;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;

use crate::decoder::decode_stream;
use crate::extract::TextExtractor;
use crate::retry::{RetryConfig, is_transient};
use crate::stream::TextDeltaStream;

/// POSTs JSON bodies with retry on transient failures.
#[derive(Clone)]
pub struct StreamClient {
    http: reqwest::Client,
    headers: HeaderMap,
    retry_config: RetryConfig,
}

impl StreamClient {
    pub fn new() -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self {
            http,
            headers,
            retry_config: RetryConfig::default(),
        })
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, ApiError> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| ApiError::BadRequest {
            message: format!("Invalid header name '{name}'"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| ApiError::BadRequest {
            message: format!("Invalid value for header '{name}'"),
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Send `Authorization: Bearer <key>`.
    pub fn with_bearer_auth(self, api_key: &str) -> Result<Self, ApiError> {
        self.with_header("authorization", &format!("Bearer {api_key}"))
            .map_err(|_| ApiError::Auth {
                message: "Invalid API key format".into(),
            })
    }

    /// Set the retry configuration for transient errors (429, 529, 5xx, network).
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// POST `body` and return the successful response, retrying transient
    /// failures. Cancellation is honoured while sending and while backing off.
    pub async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ApiError> {
        let body = serde_json::to_string(body).map_err(|e| ApiError::BadRequest {
            message: format!("Failed to serialize request: {e}"),
        })?;
        let max_retries = self.retry_config.max_retries;

        let mut attempt = 0;
        loop {
            tracing::debug!("POST {url} (attempt {}/{})", attempt + 1, max_retries + 1);

            let send = self
                .http
                .post(url)
                .headers(self.headers.clone())
                .header(ACCEPT, "application/json, text/event-stream")
                .body(body.clone())
                .send();
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(ApiError::Aborted),
                result = send => result,
            };

            let (err, retry_after) = match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let retry_after = parse_retry_after(response.headers());
                    let body_text = response.text().await.unwrap_or_default();
                    (classify_error(status.as_u16(), &body_text, retry_after), retry_after)
                }
                Err(e) if e.is_timeout() => (ApiError::Timeout, None),
                Err(e) => (ApiError::Network(e.to_string()), None),
            };

            if !is_transient(&err) || attempt >= max_retries {
                return Err(err);
            }

            let delay = self.retry_config.delay_for(attempt, retry_after);
            tracing::warn!(
                "Retryable API error (attempt {}/{}): {err}. Retrying in {delay}ms...",
                attempt + 1,
                max_retries,
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(ApiError::Aborted),
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
            attempt += 1;
        }
    }

    /// POST and decode a JSON response body.
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ApiError> {
        let response = self.post(url, body, cancel).await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(ApiError::Aborted),
            parsed = response.json::<serde_json::Value>() => {
                parsed.map_err(|e| ApiError::StreamParse(format!("Invalid JSON response: {e}")))
            }
        }
    }

    /// POST and return the streamed reply as text deltas.
    pub async fn stream_text(
        &self,
        url: &str,
        body: &serde_json::Value,
        extractor: TextExtractor,
        cancel: &CancellationToken,
    ) -> Result<TextDeltaStream, ApiError> {
        let response = self.post(url, body, cancel).await?;
        Ok(TextDeltaStream::new(response.bytes_stream(), extractor))
    }

    /// POST, stream the reply through `on_chunk`, and return the full text.
    pub async fn complete_text(
        &self,
        url: &str,
        body: &serde_json::Value,
        extractor: TextExtractor,
        on_chunk: Option<ChunkCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<String, ApiError> {
        let response = self.post(url, body, cancel).await?;
        decode_stream(response.bytes_stream(), extractor, on_chunk, cancel).await
    }
}

/// Parse the `retry-after` header value as seconds and convert to milliseconds.
fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64)
}

/// Classify an HTTP error response into a typed ApiError.
fn classify_error(status: u16, body: &str, retry_after: Option<u64>) -> ApiError {
    // OpenAI-style `{"error":{"message":...}}`; Google nests the same shape.
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: Option<ErrorDetail>,
    }
    #[derive(serde::Deserialize)]
    struct ErrorDetail {
        message: Option<String>,
    }

    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.to_string());

    match status {
        401 | 403 => ApiError::Auth { message },
        400 => ApiError::BadRequest { message },
        429 => ApiError::RateLimited {
            retry_after_ms: retry_after,
        },
        529 => ApiError::Overloaded,
        _ => ApiError::Server { status, message },
    }
}
