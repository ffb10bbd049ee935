//! HTTP implementation of the transport adapter.
//!
//! Pull: `GET {base}/queue`. Commands: `POST {base}/commands`. Push:
//! `GET {base}/queue/events` as a `text/event-stream`, consumed by a
//! background task that reconnects forever with full-jitter exponential
//! backoff until the subscription handle is cancelled.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::Instrument;
use rand::Rng;
use reqwest::{header, Client, Response};
use tokio::sync::mpsc;

use crate::config::EngineConfig;

use super::error::TransportError;
use super::sse::SseDecoder;
use super::wire::{
    parse_push_payload, CommandAck, CommandReply, CommandRequest, RejectionBody, RemoteJob,
};
use super::{PushEvent, SubscriptionHandle, TransportAdapter};

/// Default connect timeout for all HTTP requests.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A push stream that delivers nothing for this long is treated as dead
/// and reconnected. Keeps a half-open connection from silently stopping
/// updates.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Maximum length for error bodies carried in errors, to prevent log flooding.
const MAX_ERROR_BODY_LENGTH: usize = 200;

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let cut = body
            .char_indices()
            .take_while(|(i, _)| *i < MAX_ERROR_BODY_LENGTH)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}... (truncated)", &body[..cut])
    } else {
        body.to_string()
    }
}

/// Talks to the queue backend over HTTP.
pub struct HttpTransport {
    /// Client for bounded request/response calls.
    client: Client,
    /// Client without a total timeout, for the long-lived event stream.
    stream_client: Client,
    base_url: String,
    request_timeout: Duration,
    reconnect_base: Duration,
    reconnect_cap: Duration,
}

impl HttpTransport {
    /// Creates a transport with default engine configuration.
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        Self::with_config(base_url, &EngineConfig::default())
    }

    /// Creates a transport with explicit timeouts and backoff bounds.
    pub fn with_config(
        base_url: impl Into<String>,
        config: &EngineConfig,
    ) -> Result<Self, TransportError> {
        let request_timeout = config.request_timeout();
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()?;
        let stream_client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            stream_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            reconnect_base: config.reconnect_base(),
            reconnect_cap: config.reconnect_cap(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_error(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.request_timeout)
        } else {
            TransportError::Http(error)
        }
    }
}

#[async_trait]
impl TransportAdapter for HttpTransport {
    async fn fetch_snapshot(&self) -> Result<Vec<RemoteJob>, TransportError> {
        let response = self
            .client
            .get(self.url("/queue"))
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        response
            .json::<Vec<RemoteJob>>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }

    async fn send_command(&self, request: CommandRequest) -> Result<CommandReply, TransportError> {
        log::debug!("Sending {} command for job {:?}", request.kind, request.job_id);

        let response = self
            .client
            .post(self.url("/commands"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if status.is_success() {
            let body = response.text().await.map_err(TransportError::Http)?;
            let ack = if body.trim().is_empty() {
                CommandAck::default()
            } else {
                serde_json::from_str(&body).map_err(|e| TransportError::Decode(e.to_string()))?
            };
            return Ok(CommandReply::Ack(ack));
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            // The server processed the command and refused it
            let reason = serde_json::from_str::<RejectionBody>(&body)
                .ok()
                .and_then(RejectionBody::reason)
                .unwrap_or_else(|| format!("server refused command ({})", status.as_u16()));
            return Ok(CommandReply::Rejected { reason });
        }

        Err(TransportError::Status {
            status: status.as_u16(),
            body: truncate_body(&body),
        })
    }

    fn subscribe(&self, updates: mpsc::Sender<PushEvent>) -> SubscriptionHandle {
        let client = self.stream_client.clone();
        let url = self.url("/queue/events");
        let base = self.reconnect_base;
        let cap = self.reconnect_cap;
        SubscriptionHandle::new(tokio::spawn(run_subscription(client, url, updates, base, cap)))
    }
}

/// Why a connected stream stopped.
enum StreamEnd {
    ReceiverDropped,
    Disconnected(String),
}

async fn run_subscription(
    client: Client,
    url: String,
    updates: mpsc::Sender<PushEvent>,
    base: Duration,
    cap: Duration,
) {
    let mut attempt: u32 = 0;
    loop {
        match open_stream(&client, &url).await {
            Ok(response) => {
                if updates.send(PushEvent::Connected).await.is_err() {
                    return;
                }
                log::info!("Push channel connected");
                attempt = 0;

                match read_stream(response, &updates).await {
                    StreamEnd::ReceiverDropped => return,
                    StreamEnd::Disconnected(reason) => {
                        log::warn!("Push channel lost: {}", reason);
                    }
                }
            }
            Err(e) => {
                log::warn!("Push channel connect failed: {}", e);
            }
        }

        if updates.send(PushEvent::Disconnected).await.is_err() {
            return;
        }

        let delay = backoff_delay(base, cap, attempt);
        attempt = attempt.saturating_add(1);
        log::debug!(
            "Reconnecting push channel in {:?} (attempt {})",
            delay,
            attempt
        );
        tokio::time::sleep(delay).await;
    }
}

async fn open_stream(client: &Client, url: &str) -> Result<Response, TransportError> {
    let response = client
        .get(url)
        .header(header::ACCEPT, "text/event-stream")
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body: truncate_body(&body),
        });
    }
    Ok(response)
}

async fn read_stream(response: Response, updates: &mpsc::Sender<PushEvent>) -> StreamEnd {
    let span = tracing::info_span!("transport.push_stream");
    let mut decoder = SseDecoder::new();
    let mut stream = response.bytes_stream();

    async move {
    loop {
        let chunk = match tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()).await {
            Err(_) => return StreamEnd::Disconnected("idle timeout".to_string()),
            Ok(None) => return StreamEnd::Disconnected("stream ended".to_string()),
            Ok(Some(Err(e))) => return StreamEnd::Disconnected(format!("read error: {}", e)),
            Ok(Some(Ok(bytes))) => bytes,
        };

        for event in decoder.push(&chunk) {
            // Only default and "update" events carry deltas
            if let Some(name) = &event.event {
                if name != "update" {
                    log::debug!("Ignoring push event type '{}'", name);
                    continue;
                }
            }
            match parse_push_payload(&event.data) {
                Ok(deltas) => {
                    if updates.send(PushEvent::Deltas(deltas)).await.is_err() {
                        return StreamEnd::ReceiverDropped;
                    }
                }
                Err(e) => {
                    log::warn!("Dropping malformed push payload: {}", e);
                    if updates.send(PushEvent::Malformed).await.is_err() {
                        return StreamEnd::ReceiverDropped;
                    }
                }
            }
        }
    }
    }
    .instrument(span)
    .await
}

/// Full-jitter exponential backoff: uniform in [0, min(cap, base * 2^attempt)].
fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let ceiling = base.saturating_mul(2u32.saturating_pow(attempt.min(16))).min(cap);
    let millis = ceiling.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}
