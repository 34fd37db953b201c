//! Incoming-webhook delivery to the chat service.
//!
//! A delivery is one POST of `{"text": ..., "channel"?: ...}`. When the chat
//! service answers 404 with its "channel not found" error id and a named
//! channel was requested, the message is re-sent once to the webhook's
//! default channel with a warning line appended.
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::message::missing_channel_warning;

pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);
pub const MAX_LOGGED_BODY_BYTES: usize = 512;
pub const CHANNEL_NOT_FOUND_ID: &str = "web.incoming_webhook.channel.app_error";
const TRUNCATION_MARKER: &str = "... **TRUNCATED**";
const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error("received HTTP 200, but expected response data 'ok' rather than: {body}")]
    UnexpectedBody { body: String },
    #[error("received HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Sends one formatted message to a webhook.
#[async_trait]
pub trait WebhookService: Send + Sync {
    async fn deliver(&self, url: &str, channel: Option<&str>, message: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<&'a str>,
}

#[derive(Deserialize)]
struct AppErrorBody {
    #[serde(default)]
    id: Option<String>,
}

/// Captured response of a single attempt.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl WebhookResponse {
    pub fn is_ok_reply(&self) -> bool {
        self.status == StatusCode::OK.as_u16() && self.body == "ok"
    }

    /// 404 + `application/json` + the chat service's channel-not-found id.
    pub fn is_channel_not_found(&self) -> bool {
        if self.status != StatusCode::NOT_FOUND.as_u16() {
            return false;
        }
        if self.headers.get("content-type").map(String::as_str) != Some("application/json") {
            return false;
        }
        serde_json::from_str::<AppErrorBody>(&self.body)
            .ok()
            .and_then(|b| b.id)
            .is_some_and(|id| id == CHANNEL_NOT_FOUND_ID)
    }

    /// Body bounded for logs and error messages.
    pub fn logged_body(&self) -> String {
        truncate_body(&self.body)
    }

    fn into_error(self) -> DeliveryError {
        let body = self.logged_body();
        if self.status == StatusCode::OK.as_u16() {
            DeliveryError::UnexpectedBody { body }
        } else {
            DeliveryError::Status { status: self.status, body }
        }
    }
}

pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_LOGGED_BODY_BYTES {
        return body.to_string();
    }
    let mut cut = MAX_LOGGED_BODY_BYTES;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &body[..cut], TRUNCATION_MARKER)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (key, value) in header_map {
        if let Ok(value) = value.to_str() {
            headers.insert(key.as_str().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    headers
}

#[derive(Clone)]
pub struct WebhookClient {
    http: Client,
    timeout: Duration,
}

impl fmt::Debug for WebhookClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl WebhookClient {
    pub fn new() -> Result<Self, DeliveryError> {
        Self::with_timeout(DELIVERY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, DeliveryError> {
        let http = Client::builder()
            .user_agent(concat!("feed-notifier/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| DeliveryError::Client(e.to_string()))?;
        Ok(Self { http, timeout })
    }

    pub fn build_request(
        &self,
        url: &str,
        channel: Option<&str>,
        message: &str,
    ) -> Result<reqwest::Request, DeliveryError> {
        let payload = WebhookPayload { text: message, channel };
        self.http
            .post(url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .build()
            .map_err(|e| DeliveryError::Transport { message: e.to_string() })
    }

    async fn post_once(
        &self,
        url: &str,
        channel: Option<&str>,
        message: &str,
    ) -> Result<WebhookResponse, DeliveryError> {
        let request = self.build_request(url, channel, message)?;
        let res = self.http.execute(request).await.map_err(|e| self.transport_error(e))?;

        let status = res.status().as_u16();
        let headers = extract_headers(res.headers());
        let body = res.text().await.map_err(|e| self.transport_error(e))?;
        debug!(status, body = %truncate_body(&body), "webhook response");
        Ok(WebhookResponse { status, headers, body })
    }

    fn transport_error(&self, e: reqwest::Error) -> DeliveryError {
        if e.is_timeout() {
            DeliveryError::Timeout { timeout_ms: millis(self.timeout) }
        } else {
            DeliveryError::Transport { message: e.to_string() }
        }
    }
}

#[async_trait]
impl WebhookService for WebhookClient {
    #[instrument(skip_all, fields(channel = channel.unwrap_or("")))]
    async fn deliver(&self, url: &str, channel: Option<&str>, message: &str) -> Result<(), DeliveryError> {
        let mut channel = channel.map(str::to_owned);
        let mut text = message.to_owned();
        let mut attempt = 1;

        loop {
            let response = self.post_once(url, channel.as_deref(), &text).await?;
            if response.is_ok_reply() {
                return Ok(());
            }
            if attempt < MAX_ATTEMPTS && response.is_channel_not_found() {
                if let Some(missing) = channel.take() {
                    warn!(channel = %missing, "channel not found; resending to default channel");
                    text.push_str(&missing_channel_warning(&missing));
                    attempt += 1;
                    continue;
                }
            }
            return Err(response.into_error());
        }
    }
}
