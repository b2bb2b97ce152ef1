//! Server fingerprinting and the on-disk credential store
//!
//! All state persisted for a remote server lives under a single key: the
//! lowercase-hex MD5 digest of the server URL string (the *fingerprint*).
//! Files are written to the user configuration directory
//!
//! ```text
//! ${MCP_REMOTE_CONFIG_DIR or $HOME/.mcp-auth}/mcp-remote-<version>/
//! ```
//!
//! as `<fingerprint>_<name>` -- for example `a1b2..._tokens.json`. JSON
//! values are written with two-space indentation so an operator can inspect
//! them with a pager.
//!
//! The store performs no locking. Concurrent writers to the same key are
//! allowed to race; cross-process serialization is the lockfile
//! coordinator's job, not the store's.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{McpRemoteError, Result};

/// Environment variable that overrides the configuration directory root.
pub const CONFIG_DIR_ENV: &str = "MCP_REMOTE_CONFIG_DIR";

/// File name suffix for the persisted token bundle.
pub const TOKENS_FILE: &str = "tokens.json";
/// File name suffix for the registered OAuth client.
pub const CLIENT_INFO_FILE: &str = "client_info.json";
/// File name suffix for the ephemeral PKCE code verifier.
pub const CODE_VERIFIER_FILE: &str = "code_verifier.txt";
/// File name suffix for the leader lockfile.
pub const LOCK_FILE: &str = "lock.json";
/// File name suffix for the `--debug` disk log.
pub const DEBUG_LOG_FILE: &str = "debug.log";

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Computes the fingerprint of a remote server URL.
///
/// The fingerprint is the MD5 digest of the URL string rendered as 32
/// lowercase hex characters. It keys every persisted file for that server
/// and seeds the default callback port.
///
/// # Examples
///
/// ```
/// use mcp_remote::store::server_fingerprint;
///
/// let fp = server_fingerprint("https://mcp.example.com/sse");
/// assert_eq!(fp.len(), 32);
/// assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
/// ```
pub fn server_fingerprint(server_url: &str) -> String {
    let digest = Md5::digest(server_url.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Derives the default callback port from a fingerprint.
///
/// The first 16 bits of the digest (the first four hex characters) are
/// reduced into the range `[3335, 49150]`:
///
/// ```text
/// port = 3335 + (first_16_bits mod 45816)
/// ```
///
/// This makes the default port stable per server while keeping unrelated
/// servers on (almost certainly) distinct ports.
pub fn default_callback_port(fingerprint: &str) -> u16 {
    let first16 = u32::from_str_radix(fingerprint.get(..4).unwrap_or("0"), 16).unwrap_or(0);
    (3335 + (first16 % 45_816)) as u16
}

// ---------------------------------------------------------------------------
// CredentialStore
// ---------------------------------------------------------------------------

/// File-backed store for all per-server persisted state.
///
/// Operations are deliberately thin: `get` surfaces an absent file as
/// `Ok(None)`, `put` creates the directory when missing, and `delete` is
/// idempotent. Values are opaque bytes at this layer; the JSON helpers are
/// a convenience for callers that persist serde types.
///
/// # Examples
///
/// ```no_run
/// use mcp_remote::store::{CredentialStore, TOKENS_FILE};
///
/// # fn example() -> mcp_remote::error::Result<()> {
/// let store = CredentialStore::new()?;
/// let fp = mcp_remote::store::server_fingerprint("https://mcp.example.com");
/// match store.get(&fp, TOKENS_FILE)? {
///     Some(bytes) => eprintln!("found {} bytes of tokens", bytes.len()),
///     None => eprintln!("no tokens stored yet"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
}

impl CredentialStore {
    /// Opens the store at the default location.
    ///
    /// The root is `$MCP_REMOTE_CONFIG_DIR` when set, otherwise
    /// `$HOME/.mcp-auth`. The versioned subdirectory
    /// `mcp-remote-<version>` is appended so that incompatible layouts
    /// from other releases never collide.
    ///
    /// # Errors
    ///
    /// Returns [`McpRemoteError::Store`] when no home directory can be
    /// resolved and the environment override is unset.
    pub fn new() -> Result<Self> {
        let root = match std::env::var(CONFIG_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                let base = directories::BaseDirs::new().ok_or_else(|| {
                    McpRemoteError::Store("cannot resolve home directory".to_string())
                })?;
                base.home_dir().join(".mcp-auth")
            }
        };
        Ok(Self::at_root(&root))
    }

    /// Opens the store under an explicit root directory (bypassing the
    /// environment lookup). The versioned subdirectory is still appended.
    pub fn at_root(root: &Path) -> Self {
        Self {
            dir: root.join(format!("mcp-remote-{}", crate::VERSION)),
        }
    }

    /// Returns the directory all files are written into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the absolute path of the file backing `(fingerprint, name)`.
    pub fn file_path(&self, fingerprint: &str, name: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}_{name}"))
    }

    /// Reads the raw bytes stored under `(fingerprint, name)`.
    ///
    /// An absent file is `Ok(None)`, not an error.
    pub fn get(&self, fingerprint: &str, name: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.file_path(fingerprint, name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(McpRemoteError::Io(e).into()),
        }
    }

    /// Reads and deserializes the JSON value stored under
    /// `(fingerprint, name)`.
    ///
    /// # Errors
    ///
    /// Returns [`McpRemoteError::Serialization`] when the file exists but
    /// does not parse as `T`.
    pub fn get_json<T: DeserializeOwned>(&self, fingerprint: &str, name: &str) -> Result<Option<T>> {
        match self.get(fingerprint, name)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(McpRemoteError::Serialization)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Writes raw bytes under `(fingerprint, name)`, creating the store
    /// directory when missing.
    pub fn put(&self, fingerprint: &str, name: &str, bytes: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(McpRemoteError::Io)?;
        std::fs::write(self.file_path(fingerprint, name), bytes).map_err(McpRemoteError::Io)?;
        Ok(())
    }

    /// Serializes `value` as two-space-indented JSON and writes it under
    /// `(fingerprint, name)`.
    pub fn put_json<T: Serialize>(&self, fingerprint: &str, name: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(McpRemoteError::Serialization)?;
        self.put(fingerprint, name, json.as_bytes())
    }

    /// Deletes the file under `(fingerprint, name)`.
    ///
    /// Deleting an absent file is a no-op.
    pub fn delete(&self, fingerprint: &str, name: &str) -> Result<()> {
        match std::fs::remove_file(self.file_path(fingerprint, name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(McpRemoteError::Io(e).into()),
        }
    }
}

// ---------------------------------------------------------------------------
// DebugLog
// ---------------------------------------------------------------------------

/// Append-only disk log activated by `--debug`.
///
/// Each line is prefixed with an ISO-8601 UTC timestamp and this process's
/// pid, so interleaved lines from sibling proxies sharing a fingerprint can
/// be told apart. Write failures are swallowed: the debug log must never
/// take the proxy down.
#[derive(Debug, Clone)]
pub struct DebugLog {
    path: Option<PathBuf>,
}

impl DebugLog {
    /// Creates a debug log for `fingerprint`, or a disabled no-op logger
    /// when `enabled` is false.
    pub fn new(store: &CredentialStore, fingerprint: &str, enabled: bool) -> Self {
        Self {
            path: enabled.then(|| store.file_path(fingerprint, DEBUG_LOG_FILE)),
        }
    }

    /// Returns a logger that never writes.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Appends one line to the log. No-op when disabled.
    pub fn log(&self, message: &str) {
        let Some(ref path) = self.path else {
            return;
        };
        use std::io::Write as _;
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let line = format!(
            "{} [{}] {}\n",
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            std::process::id(),
            message
        );
        if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
