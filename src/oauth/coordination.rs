//! Cross-instance authorization coordination
//!
//! A stdio client with several remote servers configured often spawns
//! multiple proxy processes for the same remote in rapid succession. Only
//! one of them may run the interactive browser flow; the others must wait
//! for tokens to appear on disk.
//!
//! Election is lockfile-based. The leader writes
//! `<fingerprint>_lock.json` containing `{pid, port, timestamp}` next to
//! the credentials; late starters find it, check that it is still live,
//! and long-poll the leader's `/wait-for-auth` endpoint until the
//! authorization completes. A lockfile is considered valid only when all
//! three hold:
//!
//! 1. it is younger than 30 minutes,
//! 2. the recorded pid still exists,
//! 3. `GET http://127.0.0.1:<port>/wait-for-auth?poll=false` answers 200
//!    or 202 within one second.
//!
//! Invalid lockfiles are deleted by whichever process observes them.
//! On Windows the pid-existence probe is unreliable, so coordination is
//! skipped entirely and every process takes the leader path.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{McpRemoteError, Result};
use crate::oauth::callback::CallbackServer;
use crate::store::{CredentialStore, LOCK_FILE};

/// Maximum age of a lockfile before it is considered abandoned.
pub const LOCKFILE_MAX_AGE: Duration = Duration::from_secs(30 * 60);

/// Hard timeout for the sibling health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Lockfile
// ---------------------------------------------------------------------------

/// On-disk leader claim for one fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockfile {
    /// Pid of the claiming process.
    pub pid: u32,
    /// Callback port the claiming process bound.
    pub port: u16,
    /// Claim time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Lockfile {
    /// A claim for this process, stamped now.
    pub fn claim(port: u16) -> Self {
        Self {
            pid: std::process::id(),
            port,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Whether the claim is younger than [`LOCKFILE_MAX_AGE`].
    pub fn is_fresh(&self) -> bool {
        let age_ms = chrono::Utc::now().timestamp_millis() - self.timestamp;
        age_ms >= 0 && (age_ms as u128) < LOCKFILE_MAX_AGE.as_millis()
    }
}

/// Whether a process with the given pid currently exists.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    // Signal 0 performs the permission/existence check without delivering
    // anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    true
}

/// Probes a presumed leader's callback server.
///
/// Returns `true` when `/wait-for-auth?poll=false` answers 200 or 202
/// within one second.
pub async fn probe_leader(port: u16) -> bool {
    let Ok(client) = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() else {
        return false;
    };
    match client
        .get(format!("http://127.0.0.1:{port}/wait-for-auth?poll=false"))
        .send()
        .await
    {
        Ok(response) => {
            let status = response.status().as_u16();
            status == 200 || status == 202
        }
        Err(_) => false,
    }
}

/// Full validity check for an observed lockfile.
async fn lockfile_is_valid(lock: &Lockfile) -> bool {
    if !lock.is_fresh() {
        tracing::debug!("lockfile is older than 30 minutes");
        return false;
    }
    if !process_exists(lock.pid) {
        tracing::debug!("lockfile pid {} no longer exists", lock.pid);
        return false;
    }
    if !probe_leader(lock.port).await {
        tracing::debug!("lockfile port {} does not answer the probe", lock.port);
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// Coordination
// ---------------------------------------------------------------------------

/// Outcome of leader election for one proxy instance.
#[derive(Debug)]
pub struct Coordination {
    /// The loopback server this instance owns. For the leader this is the
    /// real callback server; for a secondary it is a placeholder on an
    /// ephemeral port that exists only to satisfy the lifecycle contract.
    pub callback: CallbackServer,
    /// `true` for secondaries: the browser flow must be skipped and tokens
    /// read from disk.
    pub skip_browser_auth: bool,
    guard: Option<LockfileGuard>,
}

impl Coordination {
    /// Removes the lockfile now (used from the SIGINT path, where waiting
    /// for drop glue is not an option).
    pub fn release_lock(&mut self) {
        self.guard.take();
    }
}

/// Deletes the lockfile when dropped, covering the normal-exit path.
#[derive(Debug)]
struct LockfileGuard {
    store: CredentialStore,
    fingerprint: String,
}

impl Drop for LockfileGuard {
    fn drop(&mut self) {
        let _ = self.store.delete(&self.fingerprint, LOCK_FILE);
    }
}

/// Runs leader election for `fingerprint` and starts the callback server.
///
/// Leaders bind the preferred callback port (or an OS-assigned one when it
/// is taken), write a fresh lockfile, and arrange for its removal on both
/// normal exit and SIGINT. Secondaries wait for the leader's completion
/// signal, then return with `skip_browser_auth` set and a placeholder
/// server; a secondary never writes tokens.
///
/// # Errors
///
/// Returns [`McpRemoteError::Callback`] when no loopback port can be
/// bound, or a store error when the lockfile cannot be written.
pub async fn coordinate(
    store: &CredentialStore,
    fingerprint: &str,
    preferred_port: u16,
    callback_path: &str,
    auth_timeout: Duration,
) -> Result<Coordination> {
    // The pid-existence probe is unreliable on Windows; every process
    // elects itself leader there.
    if cfg!(not(windows)) {
        if let Some(lock) = store.get_json::<Lockfile>(fingerprint, LOCK_FILE)? {
            if lockfile_is_valid(&lock).await {
                tracing::info!(
                    "another instance (pid {}) is authorizing on port {}; waiting",
                    lock.pid,
                    lock.port
                );
                if wait_for_leader(lock.port, auth_timeout).await {
                    // Give the leader a moment to finish flushing the token
                    // file before the first disk read.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let callback = CallbackServer::bind(0, callback_path, auth_timeout).await?;
                    return Ok(Coordination {
                        callback,
                        skip_browser_auth: true,
                        guard: None,
                    });
                }
                tracing::warn!("gave up waiting for the authorizing instance; taking over");
                store.delete(fingerprint, LOCK_FILE)?;
            } else {
                tracing::debug!("removing invalid lockfile for {fingerprint}");
                store.delete(fingerprint, LOCK_FILE)?;
            }
        }
    }

    let callback = CallbackServer::bind(preferred_port, callback_path, auth_timeout).await?;
    let lock = Lockfile::claim(callback.port());
    store
        .put_json(fingerprint, LOCK_FILE, &lock)
        .map_err(|e| McpRemoteError::Lockfile(format!("cannot write lockfile: {e}")))?;

    Ok(Coordination {
        callback,
        skip_browser_auth: false,
        guard: Some(LockfileGuard {
            store: store.clone(),
            fingerprint: fingerprint.to_string(),
        }),
    })
}

/// Long-polls the leader until it reports completion.
///
/// Returns `true` when a 200 arrived, `false` when the leader made no
/// progress for the full lockfile lifetime (persistent 5xx or connection
/// failures included) and this process should take over.
async fn wait_for_leader(port: u16, auth_timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + LOCKFILE_MAX_AGE;
    // Leave the long-poll some headroom beyond the server-side timeout.
    let Ok(client) = reqwest::Client::builder()
        .timeout(auth_timeout + Duration::from_secs(5))
        .build()
    else {
        return false;
    };
    let url = format!("http://127.0.0.1:{port}/wait-for-auth");

    while tokio::time::Instant::now() < deadline {
        match client.get(&url).send().await {
            Ok(response) if response.status().as_u16() == 200 => return true,
            Ok(response) if response.status().as_u16() == 202 => continue,
            Ok(response) => {
                tracing::debug!("leader answered HTTP {}; retrying", response.status());
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                tracing::debug!("leader poll failed: {e}; retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
