//! Streamable HTTP transport for the remote endpoint
//!
//! The newer remote transport family. Every outbound JSON-RPC message is
//! an HTTP POST against the server URL; the server answers with
//! `application/json` (a direct response body), `text/event-stream` (one
//! or more messages), or `202 Accepted` (notification acknowledgement).
//!
//! # Session management
//!
//! A successful POST may return an `Mcp-Session-Id` header; once seen, the
//! value is echoed on every subsequent POST. A `404` while a session is
//! active means the server expired it.
//!
//! # Capability probe
//!
//! Merely constructing the transport performs no I/O, so a server that
//! only speaks the SSE family would not reveal itself until the first real
//! request. [`StreamableHttpTransport::connect`] therefore issues a
//! throwaway `initialize` POST outside the session: a 404/405 answer
//! surfaces immediately (letting the strategy fall back to SSE), and a 401
//! surfaces as [`McpRemoteError::Unauthorized`] before any client traffic
//! is accepted.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::{mpsc, RwLock};
use url::Url;

use crate::error::{McpRemoteError, Result};
use crate::transport::sse::parse_sse_stream;
use crate::transport::{channel_stream, Transport};

/// Protocol revision advertised on every POST.
const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// JSON-RPC id of the throwaway capability probe.
const PROBE_REQUEST_ID: &str = "mcp-remote-fallback-test";

/// Remote transport speaking streamable HTTP.
#[derive(Debug)]
pub struct StreamableHttpTransport {
    http: reqwest::Client,
    endpoint: Url,
    headers: HashMap<String, String>,
    /// Bearer token captured at connect time. A mid-session refresh is
    /// handled by reconnecting, so caching here is fine.
    authorization: Option<String>,
    session_id: Arc<RwLock<Option<String>>>,
    last_event_id: Arc<RwLock<Option<String>>>,
    response_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    response_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    error_tx: mpsc::UnboundedSender<String>,
    error_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl StreamableHttpTransport {
    /// Builds the transport and probes the server's capability.
    ///
    /// # Arguments
    ///
    /// * `http` - Shared HTTP client.
    /// * `endpoint` - The MCP server URL (POST target).
    /// * `headers` - Caller headers merged into every request.
    /// * `token` - Access token for the `Authorization` header, when one
    ///   is available.
    ///
    /// # Errors
    ///
    /// [`McpRemoteError::Unauthorized`] when the probe answers 401;
    /// [`McpRemoteError::Transport`] (with the status text in the message)
    /// when it answers any other non-success status, 404/405 included.
    pub async fn connect(
        http: reqwest::Client,
        endpoint: Url,
        headers: HashMap<String, String>,
        token: Option<String>,
    ) -> Result<Self> {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        let transport = Self {
            http,
            endpoint,
            headers,
            authorization: token.map(|t| format!("Bearer {t}")),
            session_id: Arc::new(RwLock::new(None)),
            last_event_id: Arc::new(RwLock::new(None)),
            response_tx: Mutex::new(Some(response_tx)),
            response_rx: Arc::new(tokio::sync::Mutex::new(response_rx)),
            error_tx,
            error_rx: Arc::new(tokio::sync::Mutex::new(error_rx)),
            tasks: Mutex::new(Vec::new()),
        };
        transport.probe().await?;
        Ok(transport)
    }

    /// Issues the throwaway `initialize` probe.
    ///
    /// Runs outside the session (the response's session header, if any, is
    /// deliberately ignored and its body discarded) so a server that only
    /// speaks SSE reveals 404/405 before the router starts.
    async fn probe(&self) -> Result<()> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": PROBE_REQUEST_ID,
            "method": "initialize",
            "params": {
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": PROBE_REQUEST_ID,
                    "version": crate::VERSION,
                },
            },
        });

        let mut req = self
            .http
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", MCP_PROTOCOL_VERSION)
            .json(&body);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(ref auth) = self.authorization {
            req = req.header("Authorization", auth.as_str());
        }

        let response = req.send().await.map_err(|e| {
            McpRemoteError::Transport(format!("HTTP probe of {} failed: {e}", self.endpoint))
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
                "streamable HTTP endpoint {} returned HTTP {status}",
                self.endpoint
            ))
            .into());
        }
        Ok(())
    }

    /// Pushes a direct JSON body or spawns an SSE consumer, depending on
    /// the response content type.
    async fn dispatch_response(&self, response: reqwest::Response) -> Result<()> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let Some(response_tx) = self
            .response_tx
            .lock()
            .expect("response_tx mutex")
            .clone()
        else {
            return Ok(());
        };

        if content_type.contains("text/event-stream") {
            let (event_tx, mut event_rx) = mpsc::unbounded_channel();
            let byte_stream = response.bytes_stream();
            let parser = tokio::spawn(async move {
                parse_sse_stream(byte_stream, event_tx).await;
            });

            let last_event_id = Arc::clone(&self.last_event_id);
            let error_tx = self.error_tx.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    if let Some(id) = event.id.clone() {
                        *last_event_id.write().await = Some(id);
                    }
                    if event.is_ping() || event.data.is_empty() {
                        continue;
                    }
                    match event.event.as_deref() {
                        None | Some("message") => {
                            if response_tx.send(event.data).is_err() {
                                break;
                            }
                        }
                        Some(other) => {
                            let _ = error_tx.send(format!("unexpected SSE event `{other}`"));
                        }
                    }
                }
            });

            let mut tasks = self.tasks.lock().expect("tasks mutex");
            tasks.push(parser);
            tasks.push(forwarder);
        } else {
            let body = response
                .text()
                .await
                .map_err(|e| McpRemoteError::Transport(format!("failed to read body: {e}")))?;
            if !body.is_empty() {
                let _ = response_tx.send(body);
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for StreamableHttpTransport {
    /// POST one JSON-RPC message.
    ///
    /// Headers on every POST: `Content-Type: application/json`,
    /// `Accept: application/json, text/event-stream`,
    /// `MCP-Protocol-Version`, the caller headers, `Authorization` when a
    /// token was captured, `Mcp-Session-Id` once a session is active, and
    /// `Last-Event-ID` when resuming an SSE response stream.
    async fn send(&self, message: String) -> Result<()> {
        let mut req = self
            .http
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", MCP_PROTOCOL_VERSION)
            .body(message);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(ref auth) = self.authorization {
            req = req.header("Authorization", auth.as_str());
        }
        {
            let session = self.session_id.read().await;
            if let Some(ref id) = *session {
                req = req.header("Mcp-Session-Id", id.as_str());
            }
        }
        {
            let last = self.last_event_id.read().await;
            if let Some(ref id) = *last {
                req = req.header("Last-Event-ID", id.as_str());
            }
        }

        let response = req
            .send()
            .await
            .map_err(|e| McpRemoteError::Transport(format!("HTTP POST failed: {e}")))?;
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
        if status == reqwest::StatusCode::NOT_FOUND {
            let mut session = self.session_id.write().await;
            if session.take().is_some() {
                return Err(
                    McpRemoteError::Transport("server expired the session".to_string()).into(),
                );
            }
            return Err(
                McpRemoteError::Transport(format!("HTTP POST returned HTTP {status}")).into(),
            );
        }
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            return Err(
                McpRemoteError::Transport(format!("HTTP POST returned HTTP {status}")).into(),
            );
        }

        // Adopt the session the server assigned (typically on the
        // initialize response).
        if let Some(new_session) = response
            .headers()
            .get("Mcp-Session-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        {
            let mut session = self.session_id.write().await;
            if session.is_none() {
                tracing::debug!("adopted MCP session {new_session}");
                *session = Some(new_session);
            }
        }

        self.dispatch_response(response).await
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

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn connect(base: &str, token: Option<&str>) -> Result<StreamableHttpTransport> {
        StreamableHttpTransport::connect(
            reqwest::Client::new(),
            Url::parse(&format!("{base}/mcp")).unwrap(),
            HashMap::new(),
            token.map(str::to_string),
        )
        .await
    }

    #[tokio::test]
    async fn test_connect_probes_with_initialize() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_string_contains("mcp-remote-fallback-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        connect(&server.uri(), None).await.expect("connect");
    }

    #[tokio::test]
    async fn test_probe_405_error_mentions_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let err = connect(&server.uri(), None).await.unwrap_err();
        assert!(err.to_string().contains("405"), "{err}");
    }

    #[tokio::test]
    async fn test_probe_401_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(401)
                    .insert_header("WWW-Authenticate", r#"Bearer resource_metadata="https://r""#),
            )
            .mount(&server)
            .await;

        let err = connect(&server.uri(), None).await.unwrap_err();
        assert!(crate::error::is_unauthorized(&err), "{err}");
    }

    #[tokio::test]
    async fn test_send_delivers_json_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}}),
            ))
            .mount(&server)
            .await;

        let transport = connect(&server.uri(), None).await.expect("connect");
        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#.to_string())
            .await
            .expect("send");

        let mut rx = transport.receive();
        let message = tokio::time::timeout(Duration::from_secs(2), rx.next())
            .await
            .expect("message before timeout")
            .expect("stream open");
        assert!(message.contains("\"result\""));
    }

    #[tokio::test]
    async fn test_send_parses_sse_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let transport = connect(&server.uri(), None).await.expect("connect");
        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#.to_string())
            .await
            .expect("send");

        let mut rx = transport.receive();
        let message = tokio::time::timeout(Duration::from_secs(2), rx.next())
            .await
            .expect("message before timeout")
            .expect("stream open");
        assert!(message.contains("\"result\""));
    }

    #[tokio::test]
    async fn test_session_id_adopted_and_echoed() {
        let server = MockServer::start().await;

        // First POST (the probe) answers with a session id and is consumed
        // exactly once; every later POST must echo it.
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("Mcp-Session-Id", "sess-1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Mcp-Session-Id", "sess-1")
                    .set_body_json(serde_json::json!({})),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;

        let transport = connect(&server.uri(), None).await.expect("connect");
        // The probe ignores the session header; the first real send adopts
        // it, the second echoes it.
        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#.to_string())
            .await
            .expect("first send");
        transport
            .send(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#.to_string())
            .await
            .expect("second send");
    }

    #[tokio::test]
    async fn test_send_401_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let transport = connect(&server.uri(), None).await.expect("connect");
        let err = transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#.to_string())
            .await
            .unwrap_err();
        assert!(crate::error::is_unauthorized(&err), "{err}");
    }

    #[tokio::test]
    async fn test_bearer_token_attached_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("Authorization", "Bearer T"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        connect(&server.uri(), Some("T")).await.expect("connect");
    }
}
