//! Message transports
//!
//! This module defines the [`Transport`] trait the proxy router is built
//! on. Concrete implementations:
//!
//! - [`stdio::StdioTransport`] -- the local endpoint: this process's own
//!   stdin/stdout, speaking newline-delimited JSON to the client that
//!   spawned the proxy.
//! - [`http::StreamableHttpTransport`] -- remote endpoint over streamable
//!   HTTP (one POST per message, responses inline or as SSE).
//! - [`sse::SseTransport`] -- remote endpoint over the HTTP+SSE pair (a
//!   long-lived GET event stream plus per-message POSTs).
//! - [`fake::FakeTransport`] -- in-process pair used by router tests
//!   (cfg(test) only).
//!
//! # Design
//!
//! The trait is intentionally minimal: callers `send` a serialized
//! JSON-RPC string and `receive` a stream of serialized JSON-RPC strings.
//! A closing transport ends its receive stream; `receive_err` carries
//! diagnostics that must never shut the session down.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::oauth::provider::TokenBundle;
use crate::store::{CredentialStore, TOKENS_FILE};

/// Abstraction over the proxy's two endpoints.
///
/// Used polymorphically through `Arc<dyn Transport>`; all methods are
/// `async` or return pinned [`Stream`]s so implementations can drive I/O
/// without blocking the executor.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send a complete JSON-RPC message string to the peer.
    ///
    /// The string MUST be a single, complete JSON object. The transport is
    /// responsible for any framing required by the underlying medium
    /// (a trailing newline for stdio, an HTTP POST for the remote
    /// families).
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::McpRemoteError::Transport`] when the
    /// underlying I/O fails, or
    /// [`crate::error::McpRemoteError::Unauthorized`] when the remote
    /// answers HTTP 401.
    async fn send(&self, message: String) -> Result<()>;

    /// Returns the stream of inbound JSON-RPC message strings.
    ///
    /// Each item is a single, complete JSON object. The stream ends when
    /// the transport closes or the peer disconnects.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>>;

    /// Returns the stream of transport-level diagnostic strings.
    ///
    /// Diagnostics are logged by the router and MUST NOT be treated as an
    /// error condition.
    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>>;

    /// Closes the transport: stops background work and ends the receive
    /// stream. Idempotent.
    async fn close(&self);
}

/// Supplier of the current access token for `Authorization` headers.
///
/// The SSE transport invokes this on every outbound request so a token
/// refreshed mid-session by another instance is picked up; the streamable
/// HTTP transport captures one value at connect time.
pub type TokenSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// A [`TokenSource`] that re-reads the persisted token bundle on each
/// call.
pub fn token_source_from_store(store: CredentialStore, fingerprint: String) -> TokenSource {
    Arc::new(move || {
        store
            .get_json::<TokenBundle>(&fingerprint, TOKENS_FILE)
            .ok()
            .flatten()
            .map(|bundle| bundle.access_token)
    })
}

/// A [`TokenSource`] that always yields the same token (or none).
pub fn fixed_token_source(token: Option<String>) -> TokenSource {
    Arc::new(move || token.clone())
}

/// Adapts a shared unbounded receiver into a `'static` message stream.
///
/// Every transport here funnels inbound messages through an
/// `mpsc::UnboundedReceiver`; this keeps the `receive()` implementations
/// identical across them.
pub(crate) fn channel_stream(
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
) -> Pin<Box<dyn Stream<Item = String> + Send + 'static>> {
    Box::pin(futures::stream::unfold(rx, |rx| async move {
        let item = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        item.map(|item| (item, rx))
    }))
}

pub mod http;
pub mod sse;
pub mod stdio;

#[cfg(test)]
pub mod fake;
