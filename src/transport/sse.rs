//! HTTP+SSE transport for the remote endpoint
//!
//! The older of the two remote transport families. The client opens a
//! long-lived `GET` with `Accept: text/event-stream`; the server's first
//! event is named `endpoint` and carries the URL that outbound messages
//! must be POSTed to. Subsequent `message` events each carry one JSON-RPC
//! message. Responses to our POSTs arrive over the same event stream.
//!
//! The `Authorization` header is re-derived from the [`TokenSource`] on
//! every outbound request, so a token refreshed mid-session (possibly by a
//! sibling instance writing to the shared store) is picked up without
//! reconnecting.
//!
//! This module also hosts the SSE wire parser shared with the streamable
//! HTTP transport.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{McpRemoteError, Result};
use crate::transport::{channel_stream, TokenSource, Transport};

/// How long to wait for the server's initial `endpoint` event.
const ENDPOINT_EVENT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// SSE wire parsing
// ---------------------------------------------------------------------------

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    /// The `event:` field, when present.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
    /// The `id:` field, when present.
    pub id: Option<String>,
}

impl SseEvent {
    /// Keep-alive events are discarded before they reach the router.
    pub fn is_ping(&self) -> bool {
        self.event
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case("ping"))
            || self.data.eq_ignore_ascii_case("[ping]")
    }
}

/// Parses an SSE byte stream and forwards complete events to `tx`.
///
/// Intended to run inside a `tokio::spawn`; consumes the stream until it
/// ends or errors. Events are separated by blank lines; a trailing
/// partial event (stream cut mid-flush) is processed on a best-effort
/// basis.
pub(crate) async fn parse_sse_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    tx: mpsc::UnboundedSender<SseEvent>,
) {
    use futures::StreamExt as _;

    let mut buffer = String::new();
    tokio::pin!(byte_stream);

    while let Some(chunk_result) = byte_stream.next().await {
        let chunk = match chunk_result {
            Ok(c) => c,
            Err(_) => break,
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };
        buffer.push_str(text);

        while let Some(pos) = buffer.find("\n\n") {
            let block = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();
            if let Some(event) = parse_sse_block(&block) {
                if tx.send(event).is_err() {
                    return;
                }
            }
        }
    }

    if !buffer.is_empty() {
        if let Some(event) = parse_sse_block(&buffer) {
            let _ = tx.send(event);
        }
    }
}

/// Parses a single event block (the text between two blank lines).
///
/// Returns `None` when the block carries no data (comments, bare `retry:`
/// hints).
fn parse_sse_block(block: &str) -> Option<SseEvent> {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event_type: Option<&str> = None;
    let mut event_id: Option<&str> = None;

    for line in block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        } else if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("id:") {
            event_id = Some(value.trim());
        }
        // `retry:` hints and `:` comments are ignored.
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event_type.map(str::to_string),
        data: data_lines.join("\n"),
        id: event_id.map(str::to_string),
    })
}

// ---------------------------------------------------------------------------
// SseTransport
// ---------------------------------------------------------------------------

/// Remote transport over the HTTP+SSE pair.
pub struct SseTransport {
    http: reqwest::Client,
    /// POST target announced by the server's `endpoint` event.
    post_url: Url,
    headers: HashMap<String, String>,
    token_source: TokenSource,
    response_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    response_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    error_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("post_url", &self.post_url.as_str())
            .finish_non_exhaustive()
    }
}

impl SseTransport {
    /// Opens the event stream and resolves the POST endpoint.
    ///
    /// Issues the initial `GET` with `Accept: text/event-stream`, fails
    /// fast on 401 (as [`McpRemoteError::Unauthorized`]) and on any other
    /// non-success status (with the status text in the message, which is
    /// what the transport-fallback matcher keys on), then waits for the
    /// `endpoint` event before returning.
    ///
    /// # Errors
    ///
    /// [`McpRemoteError::Unauthorized`] on 401;
    /// [`McpRemoteError::Transport`] on other failures, including a
    /// missing `endpoint` event.
    pub async fn connect(
        http: reqwest::Client,
        server_url: Url,
        headers: HashMap<String, String>,
        token_source: TokenSource,
    ) -> Result<Self> {
        let mut req = http
            .get(server_url.as_str())
            .header("Accept", "text/event-stream");
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(token) = token_source() {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let response = req.send().await.map_err(|e| {
            McpRemoteError::Transport(format!("SSE connection to {server_url} failed: {e}"))
        })?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let www_auth = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(McpRemoteError::Unauthorized(www_auth).into());
        }
        if !status.is_success() {
            return Err(McpRemoteError::Transport(format!(
                "SSE connection to {server_url} returned HTTP {status}"
            ))
            .into());
        }

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SseEvent>();
        let byte_stream = response.bytes_stream();
        let parser = tokio::spawn(async move {
            parse_sse_stream(byte_stream, event_tx).await;
        });

        // The server's first event names the POST endpoint. Message events
        // that slip in beforehand are buffered and re-delivered below.
        let mut early_messages: Vec<String> = Vec::new();
        let endpoint_data = tokio::time::timeout(ENDPOINT_EVENT_TIMEOUT, async {
            while let Some(event) = event_rx.recv().await {
                if event.is_ping() {
                    continue;
                }
                if event.event.as_deref() == Some("endpoint") {
                    return Some(event.data);
                }
                early_messages.push(event.data);
            }
            None
        })
        .await
        .map_err(|_| {
            parser.abort();
            McpRemoteError::Transport("timed out waiting for the SSE endpoint event".to_string())
        })?
        .ok_or_else(|| {
            McpRemoteError::Transport("SSE stream ended before the endpoint event".to_string())
        })?;

        let post_url = server_url.join(&endpoint_data).map_err(|e| {
            McpRemoteError::Transport(format!("invalid endpoint event `{endpoint_data}`: {e}"))
        })?;
        tracing::debug!("SSE endpoint resolved to {post_url}");

        let (response_tx, response_rx) = mpsc::unbounded_channel::<String>();
        let (error_tx, error_rx) = mpsc::unbounded_channel::<String>();
        for message in early_messages {
            let _ = response_tx.send(message);
        }

        // Forward the remaining event stream to the router.
        let forward_tx = response_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if event.is_ping() || event.data.is_empty() {
                    continue;
                }
                match event.event.as_deref() {
                    None | Some("message") => {
                        if forward_tx.send(event.data).is_err() {
                            break;
                        }
                    }
                    Some(other) => {
                        let _ = error_tx.send(format!("unexpected SSE event `{other}`"));
                    }
                }
            }
        });

        Ok(Self {
            http,
            post_url,
            headers,
            token_source,
            response_tx: Mutex::new(Some(response_tx)),
            response_rx: Arc::new(tokio::sync::Mutex::new(response_rx)),
            error_rx: Arc::new(tokio::sync::Mutex::new(error_rx)),
            tasks: Mutex::new(vec![parser, forwarder]),
        })
    }

    /// The POST target announced by the server.
    pub fn post_url(&self) -> &Url {
        &self.post_url
    }
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    /// POST one JSON-RPC message to the announced endpoint.
    ///
    /// The bearer token is re-read from the token source per request.
    /// Responses arrive over the event stream, not in the POST body.
    async fn send(&self, message: String) -> Result<()> {
        if self.response_tx.lock().expect("response_tx mutex").is_none() {
            return Err(McpRemoteError::Transport("SSE transport is closed".into()).into());
        }

        let mut req = self
            .http
            .post(self.post_url.as_str())
            .header("Content-Type", "application/json")
            .body(message);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(token) = (self.token_source)() {
            req = req.header("Authorization", format!("Bearer {token}"));
        }

        let response = req
            .send()
            .await
            .map_err(|e| McpRemoteError::Transport(format!("SSE POST failed: {e}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let www_auth = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(McpRemoteError::Unauthorized(www_auth).into());
        }
        if !status.is_success() {
            return Err(
                McpRemoteError::Transport(format!("SSE POST returned HTTP {status}")).into(),
            );
        }
        Ok(())
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        channel_stream(Arc::clone(&self.response_rx))
    }

    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        channel_stream(Arc::clone(&self.error_rx))
    }

    async fn close(&self) {
        self.response_tx.lock().expect("response_tx mutex").take();
        for task in self.tasks.lock().expect("tasks mutex").drain(..) {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
