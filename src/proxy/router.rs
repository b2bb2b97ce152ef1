//! Bidirectional JSON-RPC router
//!
//! Forwards messages between the local stdio endpoint and the remote
//! transport. The proxy is almost transparent; the only transformations
//! are:
//!
//! - `tools/call` for a filtered name is answered locally with a JSON-RPC
//!   error and never reaches the remote,
//! - `initialize` gets ` (via mcp-remote <version>)` appended to
//!   `params.clientInfo.name`,
//! - `tools/list` responses have filtered names removed from
//!   `result.tools`.
//!
//! Request/response correlation runs through an in-memory pending table
//! keyed by the JSON-RPC id, inserted on forward and removed on response,
//! so the response transformation can consult the original request's
//! method. Within one direction messages are forwarded in arrival order;
//! across directions the id does the correlating.
//!
//! When either endpoint closes, the other is closed exactly once and the
//! session ends. Transport diagnostics are logged and never shut the
//! session down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt as _;
use serde_json::Value;

use crate::error::Result;
use crate::proxy::filter::ToolFilter;
use crate::transport::Transport;

/// What to do with a client message after transformation.
enum ClientAction {
    /// Forward (possibly rewritten) to the remote.
    Forward(Value),
    /// Answer the client locally; the remote never sees the message.
    Respond(Value),
}

/// The proxy session: two transports and the routing state between them.
pub struct ProxyRouter {
    client: Arc<dyn Transport>,
    server: Arc<dyn Transport>,
    filter: ToolFilter,
    /// id -> original client request, for response transformation.
    pending: Mutex<HashMap<String, Value>>,
}

impl ProxyRouter {
    /// Wires a router between the local client transport and the remote
    /// server transport.
    pub fn new(client: Arc<dyn Transport>, server: Arc<dyn Transport>, filter: ToolFilter) -> Self {
        Self {
            client,
            server,
            filter,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the session until either endpoint closes.
    ///
    /// Returns once both sides are closed. Individual send failures are
    /// logged and do not end the session; the closing of a receive stream
    /// does.
    pub async fn run(&self) -> Result<()> {
        // Diagnostic streams are drained in the background; per the
        // transport contract they must never terminate the session.
        let client_diag = spawn_diagnostic_logger(Arc::clone(&self.client), "client");
        let server_diag = spawn_diagnostic_logger(Arc::clone(&self.server), "server");

        let mut client_rx = self.client.receive();
        let mut server_rx = self.server.receive();
        let mut client_closed = false;
        let mut server_closed = false;

        while !client_closed && !server_closed {
            tokio::select! {
                message = client_rx.next() => match message {
                    Some(raw) => self.handle_client_message(raw).await,
                    None => {
                        tracing::info!("local endpoint closed");
                        client_closed = true;
                        if !server_closed {
                            server_closed = true;
                            self.server.close().await;
                        }
                    }
                },
                message = server_rx.next() => match message {
                    Some(raw) => self.handle_server_message(raw).await,
                    None => {
                        tracing::info!("remote endpoint closed");
                        server_closed = true;
                        if !client_closed {
                            client_closed = true;
                            self.client.close().await;
                        }
                    }
                },
            }
        }

        client_diag.abort();
        server_diag.abort();
        Ok(())
    }

    /// How many forwarded requests still await a response.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending mutex").len()
    }

    async fn handle_client_message(&self, raw: String) {
        let Ok(message) = serde_json::from_str::<Value>(&raw) else {
            tracing::warn!("forwarding unparsable client message unchanged");
            if let Err(e) = self.server.send(raw).await {
                tracing::error!("failed to forward to remote: {e:#}");
            }
            return;
        };

        match self.transform_client_message(message) {
            ClientAction::Forward(message) => {
                if let Err(e) = self.server.send(message.to_string()).await {
                    tracing::error!("failed to forward to remote: {e:#}");
                }
            }
            ClientAction::Respond(response) => {
                if let Err(e) = self.client.send(response.to_string()).await {
                    tracing::error!("failed to answer client locally: {e:#}");
                }
            }
        }
    }

    /// Applies the client-to-server transformations.
    fn transform_client_message(&self, mut message: Value) -> ClientAction {
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(ref method) = method {
            if method == "tools/call" {
                let tool = message
                    .pointer("/params/name")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if !self.filter.should_include(tool) {
                    tracing::info!("blocking tools/call for filtered tool `{tool}`");
                    return ClientAction::Respond(blocked_tool_response(
                        message.get("id").cloned().unwrap_or(Value::Null),
                        tool,
                    ));
                }
            } else if method == "initialize" {
                if let Some(name) = message
                    .pointer_mut("/params/clientInfo/name")
                    .and_then(|n| n.as_str().map(str::to_string))
                {
                    let tagged = format!("{name} (via mcp-remote {})", crate::VERSION);
                    if let Some(slot) = message.pointer_mut("/params/clientInfo/name") {
                        *slot = Value::String(tagged);
                    }
                }
            }
        }

        // Requests (id + method) are remembered so the response side can
        // recover the original method.
        if method.is_some() {
            if let Some(key) = id_key(&message) {
                self.pending
                    .lock()
                    .expect("pending mutex")
                    .insert(key, message.clone());
            }
        }

        ClientAction::Forward(message)
    }

    async fn handle_server_message(&self, raw: String) {
        let message = match serde_json::from_str::<Value>(&raw) {
            Ok(message) => self.transform_server_message(message).to_string(),
            Err(_) => {
                tracing::warn!("forwarding unparsable server message unchanged");
                raw
            }
        };
        if let Err(e) = self.client.send(message).await {
            tracing::error!("failed to forward to client: {e:#}");
        }
    }

    /// Applies the server-to-client transformations.
    fn transform_server_message(&self, mut message: Value) -> Value {
        // Only responses (id, no method) correlate back to a request.
        if message.get("method").is_some() {
            return message;
        }
        let Some(key) = id_key(&message) else {
            return message;
        };
        let Some(original) = self.pending.lock().expect("pending mutex").remove(&key) else {
            return message;
        };

        let original_method = original.get("method").and_then(Value::as_str).unwrap_or("");
        if original_method == "tools/list" {
            if let Some(tools) = message
                .pointer_mut("/result/tools")
                .and_then(Value::as_array_mut)
            {
                tools.retain(|tool| {
                    tool.get("name")
                        .and_then(Value::as_str)
                        .map_or(true, |name| self.filter.should_include(name))
                });
            }
        }
        message
    }
}

/// The local error response for a blocked `tools/call`.
fn blocked_tool_response(id: Value, tool: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": -32603,
            "message": format!("Tool \"{tool}\" is not available"),
        },
    })
}

/// Canonical pending-table key for a message id.
///
/// `1` and `"1"` render differently (`1` vs `"1"`), so numeric and string
/// ids never collide.
fn id_key(message: &Value) -> Option<String> {
    match message.get("id") {
        None | Some(Value::Null) => None,
        Some(id) => Some(id.to_string()),
    }
}

/// Logs a transport's diagnostic stream until the router stops it.
fn spawn_diagnostic_logger(
    transport: Arc<dyn Transport>,
    side: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = transport.receive_err();
        while let Some(line) = stream.next().await {
            tracing::warn!("{side} transport diagnostic: {line}");
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
