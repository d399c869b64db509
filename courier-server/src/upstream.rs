//! Upstream client for OpenAI-compatible chat completion endpoints.
//!
//! Opens a streamed `/chat/completions` call and yields incremental text
//! fragments as they arrive. One invocation per chat turn; the client never
//! retries on its own.

use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Connection establishment must fail fast.
const CONNECT_TIMEOUT_SECS: u64 = 30;
/// Per-read inactivity budget; generous so slow "thinking" models and idle
/// proxies do not cut the stream.
const READ_TIMEOUT_SECS: u64 = 600;
/// Fragment channel capacity.
const FRAGMENT_CHANNEL_CAPACITY: usize = 32;

/// Default endpoint when the caller supplies none.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
/// Default model when the caller supplies none.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Per-request routing configuration for the upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// API base URL, e.g. `https://api.openai.com/v1`
    #[serde(rename = "baseUrl", default = "default_base_url")]
    pub base_url: String,
    /// Bearer credential sent to the provider
    #[serde(rename = "apiKey", default)]
    pub api_key: String,
    /// Model name
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
        }
    }
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Error from the upstream provider, tagged by failure kind.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// Connection could not be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// Provider answered with a non-success status
    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Transport failure after the stream started
    #[error("transport error: {0}")]
    Transport(String),

    /// A stream chunk could not be decoded
    #[error("malformed stream chunk: {0}")]
    Malformed(String),
}

impl UpstreamError {
    /// Stable machine-readable kind, surfaced to stream consumers.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Status { .. } => "status",
            Self::Transport(_) => "transport",
            Self::Malformed(_) => "malformed_stream",
        }
    }
}

/// Ordered sequence of incremental text fragments for one chat turn.
pub type FragmentStream = BoxStream<'static, Result<String, UpstreamError>>;

/// Interface to a streaming chat-completion provider.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Open a streamed chat-completion call.
    ///
    /// The returned stream is finite: it ends when the provider signals
    /// completion or the connection closes. Any failure surfaces as a single
    /// `Err` item (or as the outer error if the call never connects).
    async fn stream_chat(
        &self,
        config: &UpstreamConfig,
        messages: &[ChatMessage],
    ) -> Result<FragmentStream, UpstreamError>;
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    /// Provider-specific extension enabling extended-reasoning mode,
    /// forwarded verbatim.
    chat_template_kwargs: ThinkingKwargs,
}

#[derive(Debug, Serialize)]
struct ThinkingKwargs {
    thinking: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Take the next complete event off the raw byte buffer, if one has fully
/// arrived.
///
/// The buffer accumulates raw bytes so a multi-byte character split across
/// network chunks is only decoded once the event is whole.
fn next_event(buffer: &mut Vec<u8>) -> Option<String> {
    let pos = buffer.windows(2).position(|window| window == b"\n\n")?;
    let event: Vec<u8> = buffer.drain(..pos + 2).collect();
    Some(String::from_utf8_lossy(&event).into_owned())
}

/// Extract the `data:` payload of one raw SSE event, if any.
fn sse_data_line(event_text: &str) -> Option<&str> {
    let mut data_line = None;

    for line in event_text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("data:") {
            data_line = Some(rest.trim());
        }
    }

    data_line
}

/// Decode one chunk payload into its text delta.
fn extract_delta(data: &str) -> Result<Option<String>, UpstreamError> {
    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| UpstreamError::Malformed(e.to_string()))?;

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content))
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Upstream client backed by `reqwest`.
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    /// Create a client with the relay's timeout policy.
    ///
    /// The timeouts are load-bearing, so a client that cannot be built with
    /// them is an error rather than a fallback to an untimed one.
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .read_timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .build()
            .context("failed to build upstream HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn stream_chat(
        &self,
        config: &UpstreamConfig,
        messages: &[ChatMessage],
    ) -> Result<FragmentStream, UpstreamError> {
        let url = format!(
            "{}/chat/completions",
            config.base_url.trim_end_matches('/')
        );

        let body = CompletionRequest {
            model: &config.model,
            messages,
            stream: true,
            chat_template_kwargs: ThinkingKwargs { thinking: true },
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", config.api_key))
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    UpstreamError::Connect(e.to_string())
                } else {
                    UpstreamError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(UpstreamError::Transport(e.to_string()))).await;
                        return;
                    }
                };

                buffer.extend_from_slice(&bytes);

                while let Some(event_text) = next_event(&mut buffer) {
                    let Some(data) = sse_data_line(&event_text) else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return;
                    }

                    match extract_delta(data) {
                        Ok(Some(content)) if !content.is_empty() => {
                            if tx.send(Ok(content)).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}
