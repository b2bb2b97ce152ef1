//! Runtime configuration resolved from the command line
//!
//! This module turns the raw [`Cli`](crate::cli::Cli) values into a
//! validated [`Settings`] struct:
//!
//! - enforces the https-only rule (localhost and `--allow-http` exempt),
//! - expands `${VARNAME}` references in header values from the process
//!   environment (undefined variables become the empty string, with a
//!   warning),
//! - loads `@file` JSON for the static OAuth client flags,
//! - validates `--auth-timeout` (invalid values warn and fall back to the
//!   default),
//! - resolves the callback port (explicit, or derived from the server
//!   fingerprint).
//!
//! Configuration errors are fatal: the drivers print them to stderr and
//! exit with code 1.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{McpRemoteError, Result};
use crate::oauth::provider::{ClientInformation, ClientMetadata};
use crate::store::{default_callback_port, server_fingerprint};

/// Default URL path of the loopback OAuth callback.
pub const CALLBACK_PATH: &str = "/oauth/callback";

/// Default number of seconds to wait for browser authorization.
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// TransportStrategy
// ---------------------------------------------------------------------------

/// Which remote transport family to attempt, and whether to fall back.
///
/// The `*First` variants fall back to the other family exactly once when
/// the first attempt fails with a 404/405-class error; the `*Only`
/// variants never fall back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStrategy {
    /// Server-sent events only.
    SseOnly,
    /// Streamable HTTP only.
    HttpOnly,
    /// SSE first, then streamable HTTP.
    SseFirst,
    /// Streamable HTTP first, then SSE. The default.
    HttpFirst,
}

impl FromStr for TransportStrategy {
    type Err = McpRemoteError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sse-only" => Ok(Self::SseOnly),
            "http-only" => Ok(Self::HttpOnly),
            "sse-first" => Ok(Self::SseFirst),
            "http-first" => Ok(Self::HttpFirst),
            other => Err(McpRemoteError::Config(format!(
                "invalid transport strategy `{other}` \
                 (expected sse-only, http-only, sse-first, or http-first)"
            ))),
        }
    }
}

impl std::fmt::Display for TransportStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SseOnly => "sse-only",
            Self::HttpOnly => "http-only",
            Self::SseFirst => "sse-first",
            Self::HttpFirst => "http-first",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Fully validated runtime configuration shared by both drivers.
#[derive(Debug, Clone)]
pub struct Settings {
    /// The remote MCP server URL.
    pub server_url: Url,
    /// Fingerprint of `server_url`, keying all persisted state.
    pub fingerprint: String,
    /// Resolved local callback port (explicit or fingerprint-derived).
    pub callback_port: u16,
    /// Hostname placed in the OAuth redirect URI.
    pub callback_host: String,
    /// URL path of the OAuth callback endpoint.
    pub callback_path: String,
    /// Extra headers for every remote request, after `${VAR}` expansion.
    pub headers: HashMap<String, String>,
    /// Remote transport strategy.
    pub strategy: TransportStrategy,
    /// Static client metadata for dynamic registration, when supplied.
    pub static_client_metadata: Option<ClientMetadata>,
    /// Pre-registered client credentials; presence selects the classical
    /// (non-PKCE) flow.
    pub static_client_info: Option<ClientInformation>,
    /// Optional resource indicator forwarded to the authorization server.
    pub resource: Option<Url>,
    /// Tool-name patterns hidden from the client.
    pub ignore_tools: Vec<String>,
    /// How long the callback long-poll waits for a code.
    pub auth_timeout: Duration,
    /// Whether `--debug` was given.
    pub debug: bool,
    /// Whether HTTP(S)_PROXY environment variables are honored.
    pub enable_proxy: bool,
}

impl Settings {
    /// Validates and resolves the raw CLI values.
    ///
    /// # Errors
    ///
    /// Returns [`McpRemoteError::Config`] for a non-https URL without the
    /// localhost/`--allow-http` exemption, a malformed header, an unknown
    /// transport strategy, or unreadable/unparsable `@file` JSON.
    pub fn from_cli(cli: &crate::cli::Cli) -> Result<Self> {
        let server_url = Url::parse(&cli.server_url)
            .map_err(|e| McpRemoteError::Config(format!("invalid server URL: {e}")))?;
        validate_scheme(&server_url, cli.allow_http)?;

        let fingerprint = server_fingerprint(server_url.as_str());
        let callback_port = cli
            .callback_port
            .unwrap_or_else(|| default_callback_port(&fingerprint));

        let mut headers = HashMap::new();
        for raw in &cli.headers {
            let (name, value) = parse_header(raw)?;
            headers.insert(name, expand_env_vars(&value));
        }

        let strategy = cli.transport.parse::<TransportStrategy>()?;

        let static_client_metadata = cli
            .static_oauth_client_metadata
            .as_deref()
            .map(|raw| load_json_arg(raw, "--static-oauth-client-metadata"))
            .transpose()?;
        let static_client_info = cli
            .static_oauth_client_info
            .as_deref()
            .map(|raw| load_json_arg(raw, "--static-oauth-client-info"))
            .transpose()?;

        let resource = cli
            .resource
            .as_deref()
            .map(|r| {
                Url::parse(r).map_err(|e| McpRemoteError::Config(format!("invalid --resource: {e}")))
            })
            .transpose()?;

        Ok(Self {
            server_url,
            fingerprint,
            callback_port,
            callback_host: cli.host.clone(),
            callback_path: CALLBACK_PATH.to_string(),
            headers,
            strategy,
            static_client_metadata,
            static_client_info,
            resource,
            ignore_tools: cli.ignore_tools.clone(),
            auth_timeout: parse_auth_timeout(cli.auth_timeout.as_deref()),
            debug: cli.debug,
            enable_proxy: cli.enable_proxy,
        })
    }

    /// Builds the shared HTTP client used for discovery, token endpoints,
    /// and both remote transports.
    ///
    /// Proxy environment variables are honored only when `--enable-proxy`
    /// was given; otherwise the client is built with proxies disabled.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder();
        if !self.enable_proxy {
            builder = builder.no_proxy();
        }
        builder.build().map_err(|e| McpRemoteError::Http(e).into())
    }

    /// The redirect URI registered with (and sent to) the authorization
    /// server.
    pub fn redirect_uri(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.callback_host, self.callback_port, self.callback_path
        )
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Enforces the https-only rule: http is acceptable only for
/// localhost/127.0.0.1 or when `--allow-http` was given.
fn validate_scheme(url: &Url, allow_http: bool) -> Result<()> {
    match url.scheme() {
        "https" => Ok(()),
        "http" => {
            let host = url.host_str().unwrap_or("");
            if host == "localhost" || host == "127.0.0.1" || allow_http {
                Ok(())
            } else {
                Err(McpRemoteError::Config(format!(
                    "insecure server URL `{url}`: use https://, or pass --allow-http"
                ))
                .into())
            }
        }
        other => Err(McpRemoteError::Config(format!(
            "unsupported URL scheme `{other}` (expected http or https)"
        ))
        .into()),
    }
}

/// Splits a raw `--header` value of the form `Name: Value`.
fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw.split_once(':').ok_or_else(|| {
        McpRemoteError::Config(format!("invalid header `{raw}` (expected \"Name: Value\")"))
    })?;
    let name = name.trim();
    if name.is_empty() {
        return Err(McpRemoteError::Config(format!("invalid header `{raw}`: empty name")).into());
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Expands `${VARNAME}` references from the process environment.
///
/// Undefined variables expand to the empty string and log a warning, so a
/// typo'd variable name surfaces in diagnostics instead of silently
/// malforming the header.
fn expand_env_vars(value: &str) -> String {
    let pattern =
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern compiles");
    pattern
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!("environment variable ${{{name}}} is not set; using empty string");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// Loads a JSON argument that is either inline JSON or `@path/to/file.json`.
fn load_json_arg<T: serde::de::DeserializeOwned>(raw: &str, flag: &str) -> Result<T> {
    let json = if let Some(path) = raw.strip_prefix('@') {
        std::fs::read_to_string(path)
            .map_err(|e| McpRemoteError::Config(format!("{flag}: cannot read {path}: {e}")))?
    } else {
        raw.to_string()
    };
    serde_json::from_str(&json)
        .map_err(|e| McpRemoteError::Config(format!("{flag}: invalid JSON: {e}")).into())
}

/// Parses `--auth-timeout`. Invalid or non-positive values are rejected
/// with a warning and the default is used.
fn parse_auth_timeout(raw: Option<&str>) -> Duration {
    let secs = match raw {
        None => DEFAULT_AUTH_TIMEOUT_SECS,
        Some(s) => match s.parse::<u64>() {
            Ok(n) if n > 0 => n,
            _ => {
                tracing::warn!(
                    "invalid --auth-timeout `{s}`; using default {DEFAULT_AUTH_TIMEOUT_SECS}s"
                );
                DEFAULT_AUTH_TIMEOUT_SECS
            }
        },
    };
    Duration::from_secs(secs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
