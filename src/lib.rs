//! mcp-remote - stdio-to-remote MCP proxy with OAuth authorization
//! brokering
//!
//! This library connects a locally-launched, stdio-only JSON-RPC client to
//! a remote MCP server behind OAuth-protected HTTP or SSE transport. It
//! discovers the remote's authorization endpoints, runs the interactive
//! authorization-code flow through a loopback browser redirect, persists
//! and refreshes tokens, coordinates with sibling proxy instances through
//! a lockfile, and forwards framed JSON-RPC messages bidirectionally.
//!
//! # Architecture
//!
//! - `cli` / `config`: command-line surface and validated settings
//! - `store`: server fingerprinting and the on-disk credential store
//! - `oauth`: discovery, PKCE, providers, loopback callback server,
//!   cross-instance coordination
//! - `transport`: the stdio, streamable-HTTP, and SSE transports
//! - `proxy`: transport selection, the tool filter, and the router
//! - `driver`: the shared connect-with-authorization ladder behind both
//!   binaries
//! - `error`: error types and result alias

pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod oauth;
pub mod proxy;
pub mod store;
pub mod transport;

/// Version string advertised in clientInfo tags and used for the
/// versioned configuration directory.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export commonly used types
pub use config::{Settings, TransportStrategy};
pub use error::{McpRemoteError, Result};
pub use proxy::filter::ToolFilter;
pub use proxy::router::ProxyRouter;
