//! HTTP streaming transport
//!
//! Sends prepared provider requests with retry and cancellation, and exposes
//! successful response bodies as server-sent event streams.

use crate::config::settings::{RetrySettings, TransportConfig};
use crate::utils::error::{AppError, AppResult};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{Client, Proxy, Response};
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A boxed stream of fallible items
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = AppResult<T>> + Send + 'a>>;

/// Server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name ("message" when the server sends none)
    pub event: String,
    /// Raw data payload
    pub data: String,
}

impl SseEvent {
    /// Unnamed data event
    pub fn data(data: impl Into<String>) -> Self {
        Self { event: "message".to_string(), data: data.into() }
    }

    /// Named event
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self { event: event.into(), data: data.into() }
    }
}

/// Stream of SSE events from a provider
pub type SseStream = BoxStream<'static, SseEvent>;

/// Fully built provider request
#[derive(Debug, Clone, Serialize)]
pub struct PreparedRequest {
    /// Endpoint URL
    pub url: String,
    /// Request headers, credentials included
    #[serde(skip)]
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: serde_json::Value,
}

impl PreparedRequest {
    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum retry attempts
    pub max_retries: u32,
    /// Base delay time (milliseconds)
    pub retry_delay_ms: u64,
    /// Maximum delay time (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            max_delay_ms: 30000,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            retry_delay_ms: settings.retry_delay_ms,
            max_delay_ms: settings.max_delay_ms,
        }
    }
}

impl RetryConfig {
    /// No retries
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Back-off before retry number `attempt + 1`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// HTTP transport shared by all adapters
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a new transport instance
    pub fn new(config: &TransportConfig) -> AppResult<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .user_agent(concat!("chatrelay/", env!("CARGO_PKG_VERSION")));

        // Without an explicit proxy reqwest picks up HTTP(S)_PROXY from the environment
        if let Some(proxy) = &config.http_proxy {
            debug!("Using HTTP proxy {}", proxy);
            builder = builder.proxy(Proxy::all(proxy.as_str())?);
        }

        Ok(Self { client: builder.build()? })
    }

    /// Send one attempt, mapping non-success statuses to errors
    async fn send_once(&self, prepared: &PreparedRequest) -> AppResult<Response> {
        let mut request = self.client
            .post(&prepared.url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        for (name, value) in &prepared.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.json(&prepared.body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!("Provider API request failed: {} - {}", status, body);
        Err(AppError::HttpStatus { status: status.as_u16(), body })
    }

    /// Open a streaming request.
    ///
    /// Connection failures and retryable statuses are retried with exponential
    /// back-off. Cancellation aborts the in-flight send or the back-off sleep.
    pub async fn open_stream(
        &self,
        prepared: &PreparedRequest,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> AppResult<SseStream> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                result = self.send_once(prepared) => result,
            };

            match result {
                Ok(response) => {
                    debug!("Stream opened after {} attempt(s)", attempt + 1);
                    return Ok(sse_stream(response));
                }
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt);
                    warn!("Request failed, retrying after {}ms (attempt {}/{}): {}",
                          delay.as_millis(), attempt + 1, retry.max_retries, e);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(AppError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// GET a JSON document (model listings)
    pub async fn get_json(&self, url: &str, headers: &[(String, String)]) -> AppResult<serde_json::Value> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::HttpStatus { status: status.as_u16(), body });
        }
        Ok(response.json().await?)
    }
}

/// Expose a response body as SSE events; read errors become stream errors
fn sse_stream(response: Response) -> SseStream {
    let stream = response
        .bytes_stream()
        .eventsource()
        .map(|result| match result {
            Ok(event) => Ok(SseEvent { event: event.event, data: event.data }),
            Err(e) => Err(AppError::Stream(e.to_string())),
        });
    Box::pin(stream)
}
