//! Command-line interface definition for mcp-remote
//!
//! This module defines the CLI structure using clap's derive API. The same
//! surface is shared by the proxy binary (`mcp-remote`) and the standalone
//! client binary (`mcp-remote-client`); only the driver wired behind it
//! differs.
//!
//! Raw values collected here are validated and resolved into a
//! [`Settings`](crate::config::Settings) value by `src/config.rs`; the CLI
//! layer performs no validation beyond what clap's types enforce.

use clap::Parser;

/// mcp-remote - stdio-to-remote MCP proxy with OAuth authorization brokering
///
/// Connects a stdio MCP client to a remote MCP server that requires
/// OAuth-protected HTTP or SSE transport, handling endpoint discovery,
/// browser-based authorization, token persistence and refresh, and
/// bidirectional message forwarding.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-remote")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// URL of the remote MCP server
    ///
    /// Must be https:// unless the host is localhost/127.0.0.1 or
    /// --allow-http is given.
    pub server_url: String,

    /// Local port for the OAuth callback server
    ///
    /// Defaults to a stable port derived from the server URL.
    pub callback_port: Option<u16>,

    /// Extra header sent on every remote request, as "Name: Value"
    ///
    /// May be repeated. Values support ${VARNAME} substitution from the
    /// process environment; undefined variables expand to the empty string
    /// with a warning.
    #[arg(long = "header", value_name = "NAME: VALUE")]
    pub headers: Vec<String>,

    /// Allow a plain-HTTP server URL for non-localhost hosts
    #[arg(long)]
    pub allow_http: bool,

    /// Remote transport strategy
    #[arg(long, default_value = "http-first", value_name = "STRATEGY")]
    pub transport: String,

    /// Hostname used in the OAuth redirect URI
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Static OAuth client metadata as inline JSON or @file
    #[arg(long = "static-oauth-client-metadata", value_name = "JSON|@FILE")]
    pub static_oauth_client_metadata: Option<String>,

    /// Static OAuth client information (client_id etc.) as inline JSON or @file
    ///
    /// Supplying this selects the classical (non-PKCE) authorization-code
    /// flow with the given confidential client.
    #[arg(long = "static-oauth-client-info", value_name = "JSON|@FILE")]
    pub static_oauth_client_info: Option<String>,

    /// Resource indicator URI forwarded to the authorization server
    #[arg(long, value_name = "URI")]
    pub resource: Option<String>,

    /// Glob pattern of tool names to hide from the client; may be repeated
    ///
    /// Matching is case-insensitive and anchored to both ends, with *
    /// as the only wildcard (e.g. "create*", "*account", "exactName").
    #[arg(long = "ignore-tool", value_name = "PATTERN")]
    pub ignore_tools: Vec<String>,

    /// Seconds to wait for the browser-based authorization to complete
    ///
    /// Invalid values are rejected with a warning and the default (30) is
    /// used.
    #[arg(long = "auth-timeout", value_name = "SECONDS")]
    pub auth_timeout: Option<String>,

    /// Enable debug logging (stderr and a per-server debug.log on disk)
    #[arg(long)]
    pub debug: bool,

    /// Honor HTTP_PROXY/HTTPS_PROXY/NO_PROXY from the environment
    #[arg(long)]
    pub enable_proxy: bool,
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
