//! Loopback OAuth callback server
//!
//! A small axum server bound to `127.0.0.1` that plays two roles:
//!
//! - receives the browser redirect carrying the authorization `code`
//!   (`GET <callback-path>?code=...`), and
//! - answers sibling proxy instances that poll `GET /wait-for-auth` while
//!   another instance drives the browser flow.
//!
//! Sibling instances never receive the code over HTTP. The 200/202
//! distinction on `/wait-for-auth` is a bare completion signal; siblings
//! read the tokens from disk. A 200 is only reported once the broker has
//! finished the token exchange and persisted the bundle (see
//! [`CallbackServer::mark_complete`]), so a sibling that sees 200 will
//! find tokens on disk.
//!
//! The code is handed from the HTTP handler to the awaiting broker through
//! a watch channel, and the serve task is aborted on drop so the listener
//! is released on every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;

use crate::error::{McpRemoteError, Result};

/// HTML served to the browser once the code has been captured.
const CALLBACK_HTML: &str = "<!DOCTYPE html>\n<html>\n<head><title>Authorization complete</title></head>\n<body>\n<p>Authorization complete. You may close this window.</p>\n<script>window.close();</script>\n</body>\n</html>\n";

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Authorization progress as observed by the HTTP handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No code yet.
    Pending,
    /// The browser redirect delivered a code; the exchange is in flight.
    CodeReceived,
    /// Tokens have been exchanged and persisted.
    Complete,
}

/// The authorization code (and echoed `state`) captured from the redirect.
#[derive(Debug, Clone)]
pub struct AuthCode {
    /// The `code` query parameter.
    pub code: String,
    /// The `state` query parameter, when the authorization server echoed
    /// one.
    pub state: Option<String>,
}

#[derive(Debug)]
struct Shared {
    phase: watch::Sender<Phase>,
    code: Mutex<Option<AuthCode>>,
    auth_timeout: Duration,
}

// ---------------------------------------------------------------------------
// CallbackServer
// ---------------------------------------------------------------------------

/// The loopback HTTP server owned by the broker for one session.
///
/// Constructed by the coordinator: the leader binds the real callback port,
/// a secondary binds an ephemeral placeholder (same routes, but no browser
/// is ever pointed at it, so [`wait_for_code`](Self::wait_for_code) never
/// resolves there).
#[derive(Debug)]
pub struct CallbackServer {
    port: u16,
    shared: Arc<Shared>,
    serve_task: tokio::task::JoinHandle<()>,
}

impl CallbackServer {
    /// Binds `127.0.0.1:<port>` and starts serving.
    ///
    /// When `port` is 0 or already taken, the operating system assigns a
    /// free port; the resolved port is available via [`port`](Self::port).
    ///
    /// # Arguments
    ///
    /// * `port` - Preferred port (0 for OS-assigned).
    /// * `callback_path` - URL path of the redirect endpoint, e.g.
    ///   `/oauth/callback`.
    /// * `auth_timeout` - Upper bound for a single `/wait-for-auth`
    ///   long-poll before it answers 202.
    ///
    /// # Errors
    ///
    /// Returns [`McpRemoteError::Callback`] when neither the preferred nor
    /// an OS-assigned port can be bound.
    pub async fn bind(port: u16, callback_path: &str, auth_timeout: Duration) -> Result<Self> {
        let listener = match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(l) => l,
            Err(_) if port != 0 => tokio::net::TcpListener::bind(("127.0.0.1", 0))
                .await
                .map_err(|e| McpRemoteError::Callback(format!("failed to bind loopback: {e}")))?,
            Err(e) => {
                return Err(
                    McpRemoteError::Callback(format!("failed to bind loopback: {e}")).into(),
                )
            }
        };
        let actual_port = listener
            .local_addr()
            .map_err(|e| McpRemoteError::Callback(format!("failed to read local address: {e}")))?
            .port();

        let (phase, _) = watch::channel(Phase::Pending);
        let shared = Arc::new(Shared {
            phase,
            code: Mutex::new(None),
            auth_timeout,
        });

        let app = Router::new()
            .route(callback_path, get(handle_callback))
            .route("/wait-for-auth", get(handle_wait_for_auth))
            .with_state(Arc::clone(&shared));

        let serve_task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        tracing::debug!("callback server listening on 127.0.0.1:{actual_port}");
        Ok(Self {
            port: actual_port,
            shared,
            serve_task,
        })
    }

    /// The port actually bound.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Waits until the browser redirect delivers an authorization code.
    ///
    /// On a placeholder server no redirect ever arrives, so this future
    /// never resolves; secondaries must not call it.
    ///
    /// # Errors
    ///
    /// Returns [`McpRemoteError::Callback`] if the server stops before a
    /// code arrives.
    pub async fn wait_for_code(&self) -> Result<AuthCode> {
        let mut rx = self.shared.phase.subscribe();
        loop {
            if let Some(code) = self.shared.code.lock().expect("code mutex").clone() {
                return Ok(code);
            }
            if rx.changed().await.is_err() {
                return Err(McpRemoteError::Callback(
                    "callback server stopped before a code arrived".to_string(),
                )
                .into());
            }
        }
    }

    /// Marks the authorization as complete.
    ///
    /// Called by the broker after tokens have been exchanged and persisted.
    /// From this point `/wait-for-auth` answers 200, so sibling instances
    /// that observe the signal will find tokens on disk.
    pub fn mark_complete(&self) {
        self.shared.phase.send_replace(Phase::Complete);
    }

    /// Discards a previously captured code and returns to the pending
    /// phase.
    ///
    /// Used when an exchange failed and the broker is about to run the
    /// browser flow again: without the reset,
    /// [`wait_for_code`](Self::wait_for_code) would hand back the stale
    /// code immediately.
    pub fn reset(&self) {
        *self.shared.code.lock().expect("code mutex") = None;
        self.shared.phase.send_replace(Phase::Pending);
    }

    /// Stops serving and releases the port.
    pub fn shutdown(&self) {
        self.serve_task.abort();
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.serve_task.abort();
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET <callback-path>?code=...&state=...`
///
/// Records the code, wakes the waiting broker, and serves a page that
/// invites the user to close the window. A missing `code` is a 400.
async fn handle_callback(
    State(shared): State<Arc<Shared>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(code) = params.get("code").filter(|c| !c.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing authorization code").into_response();
    };

    {
        let mut slot = shared.code.lock().expect("code mutex");
        // First redirect wins; duplicate deliveries are ignored.
        if slot.is_none() {
            *slot = Some(AuthCode {
                code: code.clone(),
                state: params.get("state").cloned(),
            });
        }
    }
    shared.phase.send_if_modified(|phase| {
        if *phase == Phase::Pending {
            *phase = Phase::CodeReceived;
            true
        } else {
            false
        }
    });

    Html(CALLBACK_HTML).into_response()
}

/// `GET /wait-for-auth[?poll=false]`
///
/// With `poll=false` this is an instant health probe: 200 when the
/// authorization has completed, 202 otherwise. Without it, the request
/// long-polls up to the configured timeout; 202 tells the sibling to
/// retry.
async fn handle_wait_for_auth(
    State(shared): State<Arc<Shared>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let long_poll = params.get("poll").map(String::as_str) != Some("false");

    if *shared.phase.subscribe().borrow() == Phase::Complete {
        return (StatusCode::OK, "Authentication completed").into_response();
    }
    if !long_poll {
        return (StatusCode::ACCEPTED, "Authentication in progress").into_response();
    }

    let mut rx = shared.phase.subscribe();
    let wait = async {
        loop {
            if *rx.borrow() == Phase::Complete {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    };
    match tokio::time::timeout(shared.auth_timeout, wait).await {
        Ok(true) => (StatusCode::OK, "Authentication completed").into_response(),
        _ => (StatusCode::ACCEPTED, "Authentication in progress").into_response(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
