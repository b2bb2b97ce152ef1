//! Error types for mcp-remote
//!
//! This module defines all error types used throughout the proxy, using
//! `thiserror` for ergonomic error handling. Operational messages never go
//! to stdout: stdout carries the JSON-RPC channel to the local client, so
//! all error display happens on stderr (or the on-disk debug log).

use thiserror::Error;

/// Main error type for mcp-remote operations
///
/// This enum encompasses all errors that can occur during configuration
/// loading, endpoint discovery, the OAuth authorization flows, transport
/// connection, and message routing.
#[derive(Error, Debug)]
pub enum McpRemoteError {
    /// Configuration-related errors (bad URL, malformed header, bad static
    /// client JSON). These fail fast with exit code 1.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Endpoint discovery errors. These are swallowed by the discovery
    /// sequence itself (fallback endpoints are always usable) and only
    /// surface when a discovery HTTP body cannot be interpreted at all.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The token endpoint rejected an authorization-code exchange.
    #[error("Token exchange failed with HTTP {status}: {body}")]
    TokenExchangeFailed {
        /// HTTP status code returned by the token endpoint
        status: u16,
        /// Response body, included verbatim for operator diagnosis
        body: String,
    },

    /// The token endpoint rejected a refresh-token exchange.
    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    /// A refresh was requested but no refresh token is stored.
    #[error("No refresh token available")]
    NoRefreshToken,

    /// The remote returned HTTP 401. The payload is the `WWW-Authenticate`
    /// header value when one was present.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Dynamic client registration failed.
    #[error("Client registration failed: {0}")]
    Registration(String),

    /// Any other OAuth protocol failure (state mismatch, missing code,
    /// unusable authorization server metadata).
    #[error("OAuth error: {0}")]
    OAuth(String),

    /// Remote transport failure (connection, HTTP status, SSE framing).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Loopback callback server failure (bind, shutdown).
    #[error("Callback server error: {0}")]
    Callback(String),

    /// Lockfile coordination failure.
    #[error("Lockfile error: {0}")]
    Lockfile(String),

    /// Credential store failure other than plain I/O.
    #[error("Credential store error: {0}")]
    Store(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for mcp-remote operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

/// Returns `true` when the error chain bottoms out in
/// [`McpRemoteError::Unauthorized`].
///
/// The connection driver uses this to distinguish "needs (re)authorization"
/// from every other failure class.
pub fn is_unauthorized(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<McpRemoteError>(),
        Some(McpRemoteError::Unauthorized(_))
    )
}

/// Returns `true` for the OAuth failure classes the connection driver may
/// recover from by invalidating credentials and re-running the flow once.
pub fn is_oauth_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<McpRemoteError>(),
        Some(
            McpRemoteError::TokenExchangeFailed { .. }
                | McpRemoteError::TokenRefreshFailed(_)
                | McpRemoteError::NoRefreshToken
        )
    )
}

/// Enriches a network error message with an operator hint when the failure
/// is caused by a self-signed certificate in the chain.
///
/// The hint names `SSL_CERT_FILE`, the conventional way to extend the
/// trusted root set for rustls-based clients.
pub fn enrich_network_error(err: anyhow::Error) -> anyhow::Error {
    let rendered = format!("{err:#}");
    if rendered.contains("self-signed certificate in certificate chain") {
        err.context(
            "the remote presented a self-signed certificate; \
             set SSL_CERT_FILE to a bundle that includes its CA",
        )
    } else {
        err
    }
}
