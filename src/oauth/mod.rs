//! OAuth 2.0 authorization brokering
//!
//! This module contains everything needed to obtain and maintain an access
//! token for the remote MCP server:
//!
//! - [`discovery`] -- locating the authorization and token endpoints.
//! - [`pkce`] -- S256 challenge generation for the PKCE flow.
//! - [`provider`] -- the classical (confidential client) and PKCE
//!   authorization-code providers, token persistence and refresh.
//! - [`callback`] -- the loopback HTTP server that receives the browser
//!   redirect and answers sibling-instance long-polls.
//! - [`coordination`] -- lockfile-based leader election so that several
//!   proxy instances for the same server share one interactive
//!   authorization.

pub mod callback;
pub mod coordination;
pub mod discovery;
pub mod pkce;
pub mod provider;
