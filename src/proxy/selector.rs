//! Transport-family selection with single fallback
//!
//! The strategy (`sse-only`, `http-only`, `sse-first`, `http-first`)
//! decides which remote transport family is attempted first. `*-first`
//! strategies fall back to the other family exactly once, and only on
//! failures that look like "this server speaks the other family": status
//! text containing `404`, `405`, `Not Found`, or `Method Not Allowed`.
//!
//! The one-shot discipline is enforced through a `recursion_reasons` set
//! shared with the connection driver: a second fallback-class failure
//! after a fallback has been spent aborts with a fixed message instead of
//! ping-ponging between families.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{Settings, TransportStrategy};
use crate::error::{McpRemoteError, Result};
use crate::transport::http::StreamableHttpTransport;
use crate::transport::sse::SseTransport;
use crate::transport::{TokenSource, Transport};

/// Marker recorded in `recursion_reasons` when the fallback is spent.
pub const REASON_TRANSPORT_FALLBACK: &str = "transport-fallback";
/// Marker recorded by the driver when an authorization retry is spent.
pub const REASON_AUTH_RETRY: &str = "auth-retry";

/// The two remote transport families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Sse,
    StreamableHttp,
}

impl Family {
    fn other(self) -> Self {
        match self {
            Self::Sse => Self::StreamableHttp,
            Self::StreamableHttp => Self::Sse,
        }
    }
}

/// Whether `err` belongs to the class that justifies trying the other
/// transport family.
pub fn is_transport_fallback_error(err: &anyhow::Error) -> bool {
    let rendered = format!("{err:#}");
    ["404", "405", "Not Found", "Method Not Allowed"]
        .iter()
        .any(|needle| rendered.contains(needle))
}

/// Connects to the remote using the configured strategy.
///
/// `recursion_reasons` must be the same set across retries of the whole
/// connection (including the driver's authorization retry) so that the
/// single-fallback guarantee holds for the session, not per attempt.
///
/// # Errors
///
/// Propagates the losing attempt's error for `*-only` strategies; for
/// `*-first` strategies, returns `Already attempted transport fallback.`
/// when a second fallback would be needed.
pub async fn connect_remote(
    settings: &Settings,
    http: &reqwest::Client,
    token_source: &TokenSource,
    recursion_reasons: &mut HashSet<&'static str>,
) -> Result<Arc<dyn Transport>> {
    let (mut family, may_fall_back) = match settings.strategy {
        TransportStrategy::SseOnly => (Family::Sse, false),
        TransportStrategy::HttpOnly => (Family::StreamableHttp, false),
        TransportStrategy::SseFirst => (Family::Sse, true),
        TransportStrategy::HttpFirst => (Family::StreamableHttp, true),
    };

    loop {
        let attempt = connect_family(family, settings, http, token_source).await;
        match attempt {
            Ok(transport) => return Ok(transport),
            Err(e) if may_fall_back && is_transport_fallback_error(&e) => {
                if !recursion_reasons.insert(REASON_TRANSPORT_FALLBACK) {
                    return Err(McpRemoteError::Transport(
                        "Already attempted transport fallback.".to_string(),
                    )
                    .into());
                }
                tracing::warn!(
                    "{family:?} transport failed ({e:#}); falling back to {:?}",
                    family.other()
                );
                family = family.other();
            }
            Err(e) => return Err(e),
        }
    }
}

async fn connect_family(
    family: Family,
    settings: &Settings,
    http: &reqwest::Client,
    token_source: &TokenSource,
) -> Result<Arc<dyn Transport>> {
    match family {
        Family::StreamableHttp => {
            let transport = StreamableHttpTransport::connect(
                http.clone(),
                settings.server_url.clone(),
                settings.headers.clone(),
                token_source(),
            )
            .await?;
            Ok(Arc::new(transport))
        }
        Family::Sse => {
            let transport = SseTransport::connect(
                http.clone(),
                settings.server_url.clone(),
                settings.headers.clone(),
                Arc::clone(token_source),
            )
            .await?;
            Ok(Arc::new(transport))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::transport::fixed_token_source;

    fn settings_for(server_uri: &str, strategy: &str) -> Settings {
        let cli = crate::cli::Cli::try_parse_from([
            "mcp-remote",
            &format!("{server_uri}/mcp"),
            "--transport",
            strategy,
        ])
        .expect("cli parses");
        Settings::from_cli(&cli).expect("settings resolve")
    }

    // -----------------------------------------------------------------------
    // Fallback-error classification
    // -----------------------------------------------------------------------

    #[test]
    fn test_fallback_class_matches_status_markers() {
        for message in [
            "endpoint returned HTTP 404 Not Found",
            "endpoint returned HTTP 405 Method Not Allowed",
            "server said: Not Found",
            "Method Not Allowed",
        ] {
            let err: anyhow::Error = McpRemoteError::Transport(message.to_string()).into();
            assert!(is_transport_fallback_error(&err), "{message}");
        }
    }

    #[test]
    fn test_other_errors_are_not_fallback_class() {
        for message in ["connection refused", "HTTP 500 Internal Server Error", "timed out"] {
            let err: anyhow::Error = McpRemoteError::Transport(message.to_string()).into();
            assert!(!is_transport_fallback_error(&err), "{message}");
        }
    }

    // -----------------------------------------------------------------------
    // connect_remote (wiremock)
    // -----------------------------------------------------------------------

    /// `http-first` against a server that rejects POST with 405 but speaks
    /// SSE: the selector must land on the SSE transport.
    #[tokio::test]
    async fn test_http_first_falls_back_to_sse_on_405() {
        let server = MockServer::start().await;
        let base = server.uri();

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                format!("event: endpoint\ndata: {base}/messages\n\n"),
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let settings = settings_for(&base, "http-first");
        let http = reqwest::Client::new();
        let token_source = fixed_token_source(None);
        let mut reasons = HashSet::new();

        let transport = connect_remote(&settings, &http, &token_source, &mut reasons)
            .await
            .expect("fallback to SSE succeeds");
        assert!(reasons.contains(REASON_TRANSPORT_FALLBACK));
        drop(transport);
    }

    /// Both families answer 405: the second fallback-class failure aborts
    /// with the fixed message.
    #[tokio::test]
    async fn test_second_fallback_class_error_is_fatal() {
        let server = MockServer::start().await;
        let base = server.uri();

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let settings = settings_for(&base, "http-first");
        let http = reqwest::Client::new();
        let token_source = fixed_token_source(None);
        let mut reasons = HashSet::new();

        let err = connect_remote(&settings, &http, &token_source, &mut reasons)
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("Already attempted transport fallback."),
            "{err}"
        );
    }

    /// `http-only` never falls back: the 405 surfaces directly.
    #[tokio::test]
    async fn test_http_only_does_not_fall_back() {
        let server = MockServer::start().await;
        let base = server.uri();

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let settings = settings_for(&base, "http-only");
        let http = reqwest::Client::new();
        let token_source = fixed_token_source(None);
        let mut reasons = HashSet::new();

        let err = connect_remote(&settings, &http, &token_source, &mut reasons)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("405"), "{err}");
        assert!(reasons.is_empty(), "only *-first strategies record a fallback");
    }

    /// A non-fallback-class failure (500) is propagated without trying the
    /// other family.
    #[tokio::test]
    async fn test_http_first_does_not_fall_back_on_500() {
        let server = MockServer::start().await;
        let base = server.uri();

        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        // If the selector wrongly fell back, this GET mock would let it
        // succeed and the assertion below would catch it.
        Mock::given(method("GET"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                format!("event: endpoint\ndata: {base}/messages\n\n"),
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let settings = settings_for(&base, "http-first");
        let http = reqwest::Client::new();
        let token_source = fixed_token_source(None);
        let mut reasons = HashSet::new();

        let result = connect_remote(&settings, &http, &token_source, &mut reasons).await;
        assert!(result.is_err(), "500 must not trigger transport fallback");
        assert!(reasons.is_empty());
    }
}
