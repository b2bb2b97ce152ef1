//! Shared connection driver
//!
//! Both binaries (the proxy and the standalone client) establish their
//! remote connection the same way:
//!
//! 1. open the credential store and, when `--debug` is set, the disk log,
//! 2. run lockfile coordination (leader election),
//! 3. attempt the transport connection with whatever token is on disk,
//! 4. on 401: leaders run the authorization broker (refresh first, then
//!    the browser flow) and reconnect once; secondaries wait for the
//!    leader's tokens to land on disk and reconnect once,
//! 5. hand the connected transport back to the caller.
//!
//! The `recursion_reasons` set spans the whole ladder, so one transport
//! fallback and one authorization retry are available per session, never
//! more.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::error::{enrich_network_error, is_oauth_error, is_unauthorized, McpRemoteError, Result};
use crate::oauth::coordination::{coordinate, Coordination};
use crate::oauth::discovery::discover;
use crate::oauth::provider::{CredentialScope, OAuthProvider};
use crate::proxy::selector::{connect_remote, REASON_AUTH_RETRY};
use crate::store::{CredentialStore, DebugLog};
use crate::transport::{token_source_from_store, Transport};

/// Marker recorded when the one credential-invalidating retry is spent.
const REASON_AUTH_INVALIDATE: &str = "auth-invalidate";

/// An established session: the connected remote plus everything that must
/// stay alive (and be cleaned up) alongside it.
pub struct Connection {
    /// The connected remote transport.
    pub remote: Arc<dyn Transport>,
    /// Coordination state. The callback server inside keeps serving
    /// `/wait-for-auth` for late-starting siblings until shutdown.
    pub coordination: Coordination,
    /// The per-server disk log (no-op unless `--debug`).
    pub debug_log: DebugLog,
}

impl Connection {
    /// Closes the remote, stops the callback server, and removes the
    /// lockfile. Safe to call once from either the signal or the normal
    /// exit path; drop glue covers whatever is left.
    pub async fn cleanup(&mut self) {
        self.remote.close().await;
        self.coordination.callback.shutdown();
        self.coordination.release_lock();
    }
}

/// Initializes tracing on stderr.
///
/// stdout belongs to the JSON-RPC channel, so the fmt layer writes to
/// stderr unconditionally. `RUST_LOG` overrides the default level
/// (`debug` with `--debug`, `info` otherwise).
pub fn init_tracing(debug: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mcp_remote={default_level}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Establishes the remote connection, authorizing as needed.
///
/// # Errors
///
/// Fatal errors (exhausted fallback/authorization retries, unusable
/// configuration, network failures outside the recoverable classes) are
/// returned for the binary to report and exit 1 on.
pub async fn establish(settings: &Settings) -> Result<Connection> {
    let store = CredentialStore::new()?;
    let debug_log = DebugLog::new(&store, &settings.fingerprint, settings.debug);
    debug_log.log(&format!(
        "mcp-remote {} connecting to {} (strategy {})",
        crate::VERSION,
        settings.server_url,
        settings.strategy
    ));

    let http = settings.http_client()?;
    let coordination = coordinate(
        &store,
        &settings.fingerprint,
        settings.callback_port,
        &settings.callback_path,
        settings.auth_timeout,
    )
    .await?;
    debug_log.log(&format!(
        "coordination complete: {} on callback port {}",
        if coordination.skip_browser_auth {
            "secondary"
        } else {
            "leader"
        },
        coordination.callback.port()
    ));

    let provider = OAuthProvider::from_settings(settings, http.clone(), store.clone());
    let token_source = token_source_from_store(store.clone(), settings.fingerprint.clone());

    let mut recursion_reasons: HashSet<&'static str> = HashSet::new();
    let remote = loop {
        match connect_remote(settings, &http, &token_source, &mut recursion_reasons).await {
            Ok(transport) => break transport,
            Err(e) if is_unauthorized(&e) => {
                if !recursion_reasons.insert(REASON_AUTH_RETRY) {
                    debug_log.log("authorization retry already spent; giving up");
                    return Err(McpRemoteError::OAuth(
                        "authorization failed after retry".to_string(),
                    )
                    .into());
                }
                debug_log.log("remote answered 401; running authorization");
                if coordination.skip_browser_auth {
                    // The leader reported completion, so tokens are on
                    // disk or about to be; re-read and reconnect.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                } else {
                    let endpoints = discover(&http, &settings.server_url, &settings.headers).await;
                    debug_log.log(&format!(
                        "authorization endpoints: {} / {}",
                        endpoints.authorization_endpoint, endpoints.token_endpoint
                    ));
                    if let Err(auth_err) = provider
                        .refresh_or_authorize(&endpoints, &coordination.callback)
                        .await
                    {
                        // A failed exchange or refresh gets one more shot
                        // with clean credentials and a fresh code.
                        if !is_oauth_error(&auth_err)
                            || !recursion_reasons.insert(REASON_AUTH_INVALIDATE)
                        {
                            return Err(auth_err);
                        }
                        tracing::warn!(
                            "authorization failed ({auth_err:#}); \
                             invalidating credentials and retrying"
                        );
                        debug_log.log("authorization failed; invalidating and retrying");
                        provider.invalidate(CredentialScope::All)?;
                        coordination.callback.reset();
                        provider
                            .refresh_or_authorize(&endpoints, &coordination.callback)
                            .await?;
                    }
                    debug_log.log("authorization complete; reconnecting");
                }
            }
            Err(e) => return Err(enrich_network_error(e)),
        }
    };

    Ok(Connection {
        remote,
        coordination,
        debug_log,
    })
}
