//! Message routing between the local stdio endpoint and the remote
//!
//! - [`filter`] -- glob-based policy hiding tool names from the client.
//! - [`selector`] -- strategy-driven choice of remote transport family,
//!   with a single fallback on 404/405-class failures.
//! - [`router`] -- bidirectional JSON-RPC forwarding with request
//!   correlation and the narrow message transformations the proxy makes.

pub mod filter;
pub mod router;
pub mod selector;
